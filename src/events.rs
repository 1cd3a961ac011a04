use crate::types::RunId;
use serde::{Deserialize, Serialize};

/// Durable audit trail of a run's script execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    Started {
        run: RunId,
        sandbox: bool,
        /// Hex SHA-256 of the main script text.
        main_digest: String,
        replay_of: Option<RunId>,
    },
    ScriptLoaded {
        name: String,
        digest: String,
    },
    /// A closure call was routed to its owner instead of a host default.
    Forwarded {
        method: String,
        argc: usize,
        from: String,
        to: String,
    },
    /// A closure call was served by a host default method.
    AmbientInvoked {
        method: String,
        argc: usize,
    },
    StepInvoked {
        call_id: String,
        step: String,
        argc: usize,
    },
    StepCompleted {
        call_id: String,
    },
    BodyStarted {
        call_id: String,
    },
    StepCompletionIgnored {
        call_id: String,
    },
    Completed,
    Failed {
        message: String,
    },
}
