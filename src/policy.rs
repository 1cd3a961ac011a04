//! Replay enablement.
//!
//! Evaluated fresh on every request; permissions and run state both change
//! underneath a long-lived service.

use crate::permissions::{Permission, PermissionCheck, PermissionTarget, Principal};
use crate::store::ExecutionOwner;
use crate::types::Run;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Enablement {
    Enabled,
    MissingReplayPermission,
    NoResumableState,
    /// The run is not sandboxed and the caller may not approve raw scripts.
    ScriptApprovalRequired,
}

impl Enablement {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Enablement::Enabled)
    }
}

/// Decide whether `principal` may replay `run`. The first failing rule wins.
pub async fn evaluate(
    principal: &Principal,
    run: &Run,
    permissions: &dyn PermissionCheck,
    owner: &dyn ExecutionOwner,
) -> Enablement {
    if !permissions.has_permission(principal, Permission::Replay, PermissionTarget::Run(&run.id)) {
        return Enablement::MissingReplayPermission;
    }

    let state = match owner.resolve_resumable_state(run).await {
        Ok(state) => state,
        Err(e) => {
            warn!(run = %run.id, error = %e, "execution state lookup failed");
            None
        }
    };
    let Some(state) = state else {
        return Enablement::NoResumableState;
    };

    if !state.sandbox
        && !permissions.has_permission(principal, Permission::RunScripts, PermissionTarget::Global)
    {
        return Enablement::ScriptApprovalRequired;
    }
    Enablement::Enabled
}
