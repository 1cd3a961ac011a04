//! Storage traits for runs, execution state and the execution event log.

use crate::events::ExecutionEvent;
use crate::state::ExecutionState;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;

/// Persistence for run records.
///
/// Runs form an arena addressed by [`RunId`]; a missing id is a normal
/// `Ok(None)` outcome (the run was deleted), never an error.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn load_run(&self, id: &RunId) -> Result<Option<Run>>;
    async fn delete_run(&self, id: &RunId) -> Result<()>;

    /// Allocate the next run number for `job`. Strictly increasing.
    async fn next_run_number(&self, job: &str) -> Result<RunNumber>;
}

/// Persistence for suspended execution state and its event log.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_execution(&self, state: &ExecutionState) -> Result<()>;
    async fn load_execution(&self, run: &RunId) -> Result<Option<ExecutionState>>;
    async fn delete_execution(&self, run: &RunId) -> Result<()>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(&self, run: &RunId, event: &ExecutionEvent) -> Result<u64>;
    async fn read_events(&self, run: &RunId, from_seq: u64) -> Result<Vec<(u64, ExecutionEvent)>>;
}

/// Locates the resumable execution state behind a run.
#[async_trait]
pub trait ExecutionOwner: Send + Sync {
    async fn resolve_resumable_state(&self, run: &Run) -> Result<Option<ExecutionState>>;
}
