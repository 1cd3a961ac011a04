//! Replay lineage.
//!
//! Each replay records the run it replays as a [`Cause::Replay`]; following
//! those links backwards reaches the run the chain started from.
//!
//! [`Cause::Replay`]: crate::types::Cause::Replay

use crate::store::RunStore;
use crate::types::{Run, RunId};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Walk replay causes back to the oldest run still present.
///
/// The walk stops at the current node when the ancestor was deleted, the
/// store cannot load it, an id repeats, or `max_hops` links were followed.
/// A run that is not a replay is its own root.
pub async fn find_root(runs: &dyn RunStore, run: &Run, max_hops: usize) -> Run {
    let mut current = run.clone();
    let mut visited: HashSet<RunId> = HashSet::from([current.id.clone()]);

    for _ in 0..max_hops {
        let Some(original) = current.replay_of().cloned() else {
            return current;
        };
        if !visited.insert(original.clone()) {
            warn!(run = %current.id, %original, "replay cycle detected");
            return current;
        }
        match runs.load_run(&original).await {
            Ok(Some(parent)) => current = parent,
            Ok(None) => {
                debug!(run = %current.id, %original, "replayed run no longer exists");
                return current;
            }
            Err(e) => {
                warn!(run = %current.id, %original, error = %e, "cannot load replayed run");
                return current;
            }
        }
    }
    warn!(run = %run.id, max_hops, "lineage walk hit its hop limit");
    current
}

/// Ids from `run` back to its root, newest first.
pub async fn chain(runs: &dyn RunStore, run: &Run, max_hops: usize) -> Vec<RunId> {
    let mut ids = vec![run.id.clone()];
    let mut current = run.clone();
    for _ in 0..max_hops {
        let Some(original) = current.replay_of().cloned() else {
            break;
        };
        if ids.contains(&original) {
            break;
        }
        match runs.load_run(&original).await {
            Ok(Some(parent)) => {
                ids.push(parent.id.clone());
                current = parent;
            }
            _ => break,
        }
    }
    ids
}
