//! Read access to the scripts a run executed.

use crate::state::ExecutionState;
use crate::store::ExecutionOwner;
use crate::types::Run;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Placeholder text for a script whose run has no resumable state.
pub const UNKNOWN_SCRIPT: &str = "???";

/// Read-only view of the scripts a run actually executed.
///
/// Every call goes back to the execution owner, so a run that is still
/// executing reports the scripts it has loaded so far.
#[derive(Clone)]
pub struct ScriptSources {
    owner: Arc<dyn ExecutionOwner>,
}

impl ScriptSources {
    pub fn new(owner: Arc<dyn ExecutionOwner>) -> Self {
        Self { owner }
    }

    /// Main script text, or [`UNKNOWN_SCRIPT`].
    pub async fn main_script(&self, run: &Run) -> String {
        match self.state(run).await {
            Some(state) => state.main_script,
            None => UNKNOWN_SCRIPT.to_string(),
        }
    }

    /// Loaded scripts by name; empty when there is no resumable state.
    pub async fn loaded_scripts(&self, run: &Run) -> BTreeMap<String, String> {
        self.state(run)
            .await
            .map(|state| state.loaded_scripts)
            .unwrap_or_default()
    }

    /// The resumable state, with lookup failures logged and treated as absent.
    pub async fn state(&self, run: &Run) -> Option<ExecutionState> {
        match self.owner.resolve_resumable_state(run).await {
            Ok(state) => state,
            Err(e) => {
                warn!(run = %run.id, error = %e, "cannot resolve execution state");
                None
            }
        }
    }
}
