//! Parameter partitioning and the capability interface the trainer drives.
//!
//! A [`ParameterSet`] is a snapshot: merging an adapter replaces the adapter
//! variables, so any set fetched before a merge refers to stale tensors and
//! must be fetched again from [`LanguageModel::parameters`].

use candle_core::{Device, Result, Tensor, Var};

/// Role a tensor plays during adapter training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterRole {
    /// Frozen base weights that only change when an adapter is merged.
    BaseFrozen,
    /// Low-rank adapter factors, replaced on every merge.
    Adapter,
    /// Everything else that receives gradients (norms, embeddings, heads).
    Trainable,
}

impl ParameterRole {
    pub fn is_trainable(self) -> bool {
        !matches!(self, ParameterRole::BaseFrozen)
    }
}

#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
    pub role: ParameterRole,
}

impl NamedParameter {
    pub fn numel(&self) -> usize {
        self.var.as_tensor().elem_count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    entries: Vec<NamedParameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, var: Var, role: ParameterRole) {
        self.entries.push(NamedParameter {
            name: name.into(),
            var,
            role,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedParameter> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&NamedParameter> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Parameters the optimizer should track, in model order.
    pub fn trainable(&self) -> impl Iterator<Item = &NamedParameter> {
        self.entries.iter().filter(|entry| entry.role.is_trainable())
    }

    pub fn with_role(&self, role: ParameterRole) -> impl Iterator<Item = &NamedParameter> {
        self.entries.iter().filter(move |entry| entry.role == role)
    }

    pub fn names_with_role(&self, role: ParameterRole) -> Vec<String> {
        self.with_role(role).map(|entry| entry.name.clone()).collect()
    }

    pub fn numel(&self) -> usize {
        self.entries.iter().map(NamedParameter::numel).sum()
    }

    pub fn trainable_numel(&self) -> usize {
        self.trainable().map(NamedParameter::numel).sum()
    }
}

/// What the training loop needs from a model, independent of whether an
/// adapter is attached.
pub trait LanguageModel: Send {
    /// Mean next-token loss for a `(batch, seq)` tensor of token ids.
    fn loss(&self, input_ids: &Tensor) -> Result<Tensor>;

    fn has_adapter(&self) -> bool;

    /// Folds the adapter into the base weights and starts a fresh adapter
    /// drawn from `seed`. A model without an adapter treats this as a no-op.
    fn merge_and_reinit(&mut self, seed: u64) -> Result<()>;

    fn parameters(&self) -> ParameterSet;

    fn vocab_size(&self) -> usize;

    fn device(&self) -> &Device;
}
