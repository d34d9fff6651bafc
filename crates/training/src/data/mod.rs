use std::{fs, path::Path, sync::Arc};

use candle_core::{Device, Tensor};

use crate::errors::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Vocabulary of [`ByteCorpus`]: one token per byte value.
pub const BYTE_VOCAB_SIZE: usize = 256;

/// Rectangular batch of token ids, one row per sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub input_ids: Vec<Vec<u32>>,
}

impl Batch {
    pub fn num_sequences(&self) -> usize {
        self.input_ids.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.input_ids.iter().map(Vec::len).sum()
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let rows = self.input_ids.len();
        let cols = self.input_ids.first().map_or(0, Vec::len);
        if rows == 0 || cols == 0 {
            return Err(TrainingError::runtime("batch is empty"));
        }
        if self.input_ids.iter().any(|row| row.len() != cols) {
            return Err(TrainingError::runtime(
                "batch rows must all have the same length",
            ));
        }
        let flat: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (rows, cols), device)?)
    }
}

/// Source of training or evaluation batches for one rank.
pub trait DataSource: Send {
    /// Next batch, or `None` once the source is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Advances past `count` batches without materializing them. Returns how
    /// many were actually skipped.
    fn skip_batches(&mut self, count: usize) -> Result<usize>;

    /// Restarts iteration from the first batch.
    fn rewind(&mut self) -> Result<()>;

    fn vocab_size(&self) -> Option<usize> {
        None
    }
}

/// Fixed-length token sequences held in memory.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    sequences: Vec<Vec<u32>>,
    vocab_size: Option<usize>,
}

impl TokenDataset {
    pub fn from_sequences(sequences: Vec<Vec<u32>>, vocab_size: Option<usize>) -> Self {
        Self {
            sequences,
            vocab_size,
        }
    }

    /// Cuts a token stream into `max_length` chunks; the ragged tail is dropped.
    pub fn from_tokens(tokens: &[u32], max_length: usize, vocab_size: Option<usize>) -> Result<Self> {
        if max_length == 0 {
            return Err(TrainingError::initialization(
                "max_length must be greater than zero",
            ));
        }
        let sequences = tokens
            .chunks_exact(max_length)
            .map(<[u32]>::to_vec)
            .collect();
        Ok(Self::from_sequences(sequences, vocab_size))
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn vocab_size(&self) -> Option<usize> {
        self.vocab_size
    }

    pub fn sequence(&self, index: usize) -> Option<&[u32]> {
        self.sequences.get(index).map(Vec::as_slice)
    }
}

/// Raw bytes of a text file as tokens.
pub struct ByteCorpus;

impl ByteCorpus {
    pub fn load(path: &Path, max_length: usize) -> Result<TokenDataset> {
        let bytes = fs::read(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read corpus {}: {err}",
                path.display()
            ))
        })?;
        let tokens: Vec<u32> = bytes.into_iter().map(u32::from).collect();
        let dataset = TokenDataset::from_tokens(&tokens, max_length, Some(BYTE_VOCAB_SIZE))?;
        if dataset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "corpus {} is shorter than one sequence of {max_length} tokens",
                path.display()
            )));
        }
        Ok(dataset)
    }
}

/// Serves the rank's share of a [`TokenDataset`]: sequence `i` belongs to
/// rank `i % world_size`.
#[derive(Debug, Clone)]
pub struct ShardedLoader {
    dataset: Arc<TokenDataset>,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl ShardedLoader {
    pub fn new(
        dataset: Arc<TokenDataset>,
        rank: usize,
        world_size: usize,
        batch_size: usize,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainingError::initialization(format!(
                "invalid shard {rank} of {world_size}"
            )));
        }
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch_size must be greater than zero",
            ));
        }
        let indices = (rank..dataset.len()).step_by(world_size).collect();
        Ok(Self {
            dataset,
            indices,
            batch_size,
            cursor: 0,
        })
    }

    /// Size of the batch starting at `cursor`; a short tail is dropped.
    fn batch_len_at(&self, cursor: usize) -> usize {
        let remaining = self.indices.len().saturating_sub(cursor);
        if remaining >= self.batch_size {
            self.batch_size
        } else {
            0
        }
    }
}

impl DataSource for ShardedLoader {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let len = self.batch_len_at(self.cursor);
        if len == 0 {
            return Ok(None);
        }
        let input_ids = self.indices[self.cursor..self.cursor + len]
            .iter()
            .filter_map(|&index| self.dataset.sequence(index))
            .map(<[u32]>::to_vec)
            .collect();
        self.cursor += len;
        Ok(Some(Batch { input_ids }))
    }

    fn skip_batches(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count {
            let len = self.batch_len_at(self.cursor);
            if len == 0 {
                break;
            }
            self.cursor += len;
            skipped += 1;
        }
        Ok(skipped)
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn vocab_size(&self) -> Option<usize> {
        self.dataset.vocab_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(sequences: usize) -> Arc<TokenDataset> {
        let tokens: Vec<u32> = (0..(sequences * 4) as u32).collect();
        Arc::new(TokenDataset::from_tokens(&tokens, 4, Some(64)).unwrap())
    }

    #[test]
    fn shards_are_disjoint_round_robin() {
        let data = dataset(8);
        let mut rank0 = ShardedLoader::new(Arc::clone(&data), 0, 2, 2).unwrap();
        let mut rank1 = ShardedLoader::new(data, 1, 2, 2).unwrap();
        let first0 = rank0.next_batch().unwrap().unwrap();
        let first1 = rank1.next_batch().unwrap().unwrap();
        assert_eq!(first0.input_ids[0], vec![0, 1, 2, 3]);
        assert_eq!(first0.input_ids[1], vec![8, 9, 10, 11]);
        assert_eq!(first1.input_ids[0], vec![4, 5, 6, 7]);
    }

    #[test]
    fn skip_matches_consuming_batches() {
        let data = dataset(10);
        let mut skipped = ShardedLoader::new(Arc::clone(&data), 0, 1, 3).unwrap();
        let mut consumed = ShardedLoader::new(data, 0, 1, 3).unwrap();
        assert_eq!(skipped.skip_batches(2).unwrap(), 2);
        consumed.next_batch().unwrap();
        consumed.next_batch().unwrap();
        assert_eq!(skipped.next_batch().unwrap(), consumed.next_batch().unwrap());
        // 10 sequences in batches of 3: the short tail is dropped
        assert!(skipped.next_batch().unwrap().is_none());
        assert_eq!(consumed.skip_batches(5).unwrap(), 0);
    }

    #[test]
    fn short_tail_is_dropped_and_rewind_restarts() {
        let mut loader = ShardedLoader::new(dataset(5), 0, 1, 2).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| loader.next_batch().unwrap())
            .map(|batch| batch.num_sequences())
            .collect();
        assert_eq!(sizes, vec![2, 2]);
        loader.rewind().unwrap();
        assert_eq!(loader.next_batch().unwrap().unwrap().input_ids[0][0], 0);
    }

    #[test]
    fn batch_tensor_has_rows_by_columns() {
        let batch = Batch {
            input_ids: vec![vec![1, 2, 3], vec![4, 5, 6]],
        };
        let tensor = batch.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3]);
        assert_eq!(batch.num_tokens(), 6);
    }
}
