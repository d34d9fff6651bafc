//! Collective primitives shared by every rank of a data-parallel run.
//!
//! Ranks coordinate only through [`ProcessGroup::barrier`] and
//! [`ProcessGroup::all_reduce_sum`]. Each call carries a call-site tag; the
//! in-process group checks that every rank presented the same tag so a
//! branch divergence turns into an error instead of a silent hang.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::error;

use crate::errors::{Result, TrainingError};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Blocks until every rank reaches a barrier with the same tag.
    fn barrier(&self, tag: &str) -> Result<()>;

    /// Element-wise sum across ranks; every rank receives the total.
    fn all_reduce_sum(&self, tag: &str, values: &mut [f64]) -> Result<()>;

    /// Cancels the group. Ranks blocked in, or later entering, a collective
    /// fail with [`TrainingError::GroupAborted`].
    fn abort(&self);

    fn is_main(&self) -> bool {
        self.rank() == 0
    }
}

/// World of one. Collectives return immediately.
#[derive(Debug, Default)]
pub struct SingleProcess {
    aborted: Mutex<bool>,
}

impl SingleProcess {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_aborted(&self) -> Result<()> {
        if *lock(&self.aborted) {
            return Err(TrainingError::GroupAborted);
        }
        Ok(())
    }
}

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self, _tag: &str) -> Result<()> {
        self.check_aborted()
    }

    fn all_reduce_sum(&self, _tag: &str, _values: &mut [f64]) -> Result<()> {
        self.check_aborted()
    }

    fn abort(&self) {
        *lock(&self.aborted) = true;
    }
}

#[derive(Debug)]
struct Rendezvous {
    generation: u64,
    arrived: usize,
    aborted: bool,
    pending: Vec<Option<(String, Vec<f64>)>>,
    outcome: std::result::Result<Vec<f64>, String>,
    /// Per-rank collective tags; `None` unless the world was built recording.
    history: Option<Vec<Vec<String>>>,
}

#[derive(Debug)]
struct Shared {
    world_size: usize,
    state: Mutex<Rendezvous>,
    wake: Condvar,
}

/// N simulated ranks living on threads of one process. Every rank owns a
/// handle; handles for the same world share one rendezvous point.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalProcessGroup {
    /// Returns one handle per rank, indexed by rank.
    pub fn new_world(world_size: usize) -> Result<Vec<Self>> {
        Self::build_world(world_size, false)
    }

    /// Like [`new_world`](Self::new_world), but every rank keeps the tags of
    /// the collectives it entered. The log grows with every collective.
    pub fn new_world_recording(world_size: usize) -> Result<Vec<Self>> {
        Self::build_world(world_size, true)
    }

    fn build_world(world_size: usize, record: bool) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(TrainingError::configuration(
                "world size must be greater than zero",
            ));
        }
        let shared = Arc::new(Shared {
            world_size,
            state: Mutex::new(Rendezvous {
                generation: 0,
                arrived: 0,
                aborted: false,
                pending: vec![None; world_size],
                outcome: Ok(Vec::new()),
                history: record.then(|| vec![Vec::new(); world_size]),
            }),
            wake: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    /// Tags of every collective this rank has entered, in call order. Empty
    /// unless the world was built with
    /// [`new_world_recording`](Self::new_world_recording).
    pub fn history(&self) -> Vec<String> {
        lock(&self.shared.state)
            .history
            .as_ref()
            .map(|history| history[self.rank].clone())
            .unwrap_or_default()
    }

    fn rendezvous(&self, tag: &str, contribution: Vec<f64>) -> Result<Vec<f64>> {
        let mut state = lock(&self.shared.state);
        if state.aborted {
            return Err(TrainingError::GroupAborted);
        }
        let rank = self.rank;
        if let Some(history) = state.history.as_mut() {
            history[rank].push(tag.to_string());
        }
        state.pending[self.rank] = Some((tag.to_string(), contribution));
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == self.shared.world_size {
            let pending: Vec<_> = state.pending.iter_mut().map(Option::take).collect();
            state.outcome = combine(pending);
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.wake.notify_all();
        } else {
            while state.generation == generation && !state.aborted {
                state = self
                    .shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.generation == generation {
                return Err(TrainingError::GroupAborted);
            }
        }

        state.outcome.clone().map_err(|reason| {
            error!(rank = self.rank, tag, %reason, "collective desync");
            TrainingError::Collective {
                rank: self.rank,
                tag: tag.to_string(),
                reason,
            }
        })
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self, tag: &str) -> Result<()> {
        self.rendezvous(tag, Vec::new()).map(|_| ())
    }

    fn all_reduce_sum(&self, tag: &str, values: &mut [f64]) -> Result<()> {
        let total = self.rendezvous(tag, values.to_vec())?;
        values.copy_from_slice(&total);
        Ok(())
    }

    fn abort(&self) {
        let mut state = lock(&self.shared.state);
        state.aborted = true;
        self.shared.wake.notify_all();
    }
}

/// Sums contributions in rank order once every rank has arrived.
fn combine(pending: Vec<Option<(String, Vec<f64>)>>) -> std::result::Result<Vec<f64>, String> {
    let mut entries = pending.into_iter().enumerate();
    let Some((_, Some((expected_tag, first)))) = entries.next() else {
        return Err("rank 0 did not contribute".to_string());
    };
    let mut total = first;
    for (rank, entry) in entries {
        let Some((tag, values)) = entry else {
            return Err(format!("rank {rank} did not contribute"));
        };
        if tag != expected_tag {
            return Err(format!(
                "rank 0 entered `{expected_tag}` while rank {rank} entered `{tag}`"
            ));
        }
        if values.len() != total.len() {
            return Err(format!(
                "rank 0 reduced {} values while rank {rank} reduced {}",
                total.len(),
                values.len()
            ));
        }
        for (acc, value) in total.iter_mut().zip(values) {
            *acc += value;
        }
    }
    Ok(total)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Averages `values` across the group in place.
pub fn all_reduce_mean(group: &dyn ProcessGroup, tag: &str, values: &mut [f64]) -> Result<()> {
    group.all_reduce_sum(tag, values)?;
    let world = group.world_size() as f64;
    for value in values.iter_mut() {
        *value /= world;
    }
    Ok(())
}
