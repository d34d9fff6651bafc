//! Process-wide `tracing` setup.
//!
//! Only the main rank emits `info` progress; the trainer gates those calls on
//! [`ProcessGroup::is_main`](crate::distributed::ProcessGroup::is_main).
//! Warnings and errors are emitted by every rank inside its `rank` span, so
//! each line carries the rank that produced it.

use tracing::{span, Level, Span};
use tracing_subscriber::EnvFilter;

use crate::errors::{Result, TrainingError};

/// Installs the global subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|err| {
            TrainingError::initialization(format!("invalid log filter '{default_directive}': {err}"))
        })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .map_err(|err| TrainingError::initialization(format!("failed to install logger: {err}")))
}

/// Span every rank's work runs inside.
pub fn rank_span(rank: usize, world_size: usize) -> Span {
    span!(Level::ERROR, "rank", rank, world_size)
}
