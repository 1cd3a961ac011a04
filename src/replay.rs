//! Replay service
//!
//! Entry point for everything a user does with an existing run's scripts:
//! checking whether replay is allowed, reading the scripts a run executed,
//! launching an edited copy as a new run, and diffing a replay against the
//! root of its lineage.

use crate::compiler::compile;
use crate::config::ReplayConfig;
use crate::diff::diff_one;
use crate::error::{ReplayError, ReplayResult};
use crate::form::ReplayForm;
use crate::lineage::find_root;
use crate::permissions::{PermissionCheck, Principal};
use crate::policy::{evaluate, Enablement};
use crate::scheduler::{QueueHandle, Scheduler};
use crate::scripts::{ScriptSources, UNKNOWN_SCRIPT};
use crate::store::{ExecutionOwner, RunStore};
use crate::types::{Cause, Run, RunAction, RunActionKind};
use anyhow::Result;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Action kinds carried over from the replayed run. Everything else is dropped.
pub const COPIED_ACTIONS: &[RunActionKind] = &[RunActionKind::Parameters, RunActionKind::ScmRevision];

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub main_script: String,
    pub loaded_scripts: BTreeMap<String, String>,
    /// Recorded on the new run's user cause.
    pub requested_by: Option<String>,
}

/// Outcome of a form submission.
#[derive(Debug)]
pub struct ReplaySubmission {
    /// Where the caller goes next: the owning job, since the new run may
    /// still be queued.
    pub redirect_to: String,
    pub handle: Option<QueueHandle>,
}

pub struct ReplayService {
    runs: Arc<dyn RunStore>,
    owner: Arc<dyn ExecutionOwner>,
    sources: ScriptSources,
    permissions: Arc<dyn PermissionCheck>,
    scheduler: Arc<dyn Scheduler>,
    config: ReplayConfig,
}

impl ReplayService {
    pub fn new(
        runs: Arc<dyn RunStore>,
        owner: Arc<dyn ExecutionOwner>,
        permissions: Arc<dyn PermissionCheck>,
        scheduler: Arc<dyn Scheduler>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            runs,
            sources: ScriptSources::new(owner.clone()),
            owner,
            permissions,
            scheduler,
            config,
        }
    }

    // ─── Enablement ───────────────────────────────────────────

    pub async fn check(&self, principal: &Principal, run: &Run) -> Enablement {
        evaluate(principal, run, self.permissions.as_ref(), self.owner.as_ref()).await
    }

    pub async fn is_enabled(&self, principal: &Principal, run: &Run) -> bool {
        self.check(principal, run).await.is_enabled()
    }

    // ─── Script sources ───────────────────────────────────────

    pub async fn original_script(&self, run: &Run) -> String {
        self.sources.main_script(run).await
    }

    pub async fn original_loaded_scripts(&self, run: &Run) -> BTreeMap<String, String> {
        self.sources.loaded_scripts(run).await
    }

    /// Compile edited script text without running it, so a form can flag
    /// mistakes before submission. The error names the offending line.
    pub fn check_script(&self, text: &str) -> Result<(), String> {
        compile(text).map(|_| ()).map_err(|e| format!("{e:#}"))
    }

    // ─── Launch ───────────────────────────────────────────────

    /// Queue a replay of `run` with replacement scripts.
    ///
    /// `None` when the run has no resumable state or the scheduler did not
    /// accept the submission.
    pub async fn launch(&self, run: &Run, request: ReplayRequest) -> Option<QueueHandle> {
        let state = self.sources.state(run).await?;

        // Scripts the request leaves out keep the text the original run
        // loaded, not whatever the job library holds today.
        let mut loaded_scripts = state.loaded_scripts.clone();
        loaded_scripts.extend(request.loaded_scripts);

        let mut actions = vec![
            RunAction::ReplayFlowFactory {
                main_script: request.main_script,
                loaded_scripts,
                sandbox: state.sandbox,
            },
            RunAction::Causes {
                causes: vec![
                    Cause::UserId {
                        user_id: request.requested_by,
                    },
                    Cause::Replay {
                        original: run.id.clone(),
                    },
                ],
            },
        ];
        actions.extend(
            run.actions
                .iter()
                .filter(|action| COPIED_ACTIONS.contains(&action.kind()))
                .cloned(),
        );

        match self
            .scheduler
            .submit(&run.id.job, self.config.quiet_period, actions)
            .await
        {
            Ok(Some(handle)) => {
                info!(run = %run.id, item = handle.item_id, "replay queued");
                Some(handle)
            }
            Ok(None) => {
                warn!(run = %run.id, "scheduler refused replay");
                None
            }
            Err(e) => {
                warn!(run = %run.id, error = %e, "replay submission failed");
                None
            }
        }
    }

    /// Handle a submitted replay form.
    pub async fn submit_form(
        &self,
        principal: &Principal,
        run: &Run,
        form: &Json,
    ) -> ReplayResult<ReplaySubmission> {
        let enablement = self.check(principal, run).await;
        if !enablement.is_enabled() {
            return Err(ReplayError::PermissionDenied(format!(
                "{} may not replay {}: {enablement:?}",
                principal.actor_id, run.id
            )));
        }
        let form = ReplayForm::from_json(form)?;

        // Loaded scripts are read now, not when the form was rendered.
        let current = self.sources.loaded_scripts(run).await;
        let handle = self
            .launch(
                run,
                ReplayRequest {
                    main_script: form.main_script.clone(),
                    loaded_scripts: form.replacement_scripts(&current),
                    requested_by: Some(principal.actor_id.clone()),
                },
            )
            .await;

        Ok(ReplaySubmission {
            redirect_to: format!("/job/{}/", run.id.job),
            handle,
        })
    }

    // ─── Diff ─────────────────────────────────────────────────

    /// Unified diff of `run`'s scripts against the root of its lineage.
    ///
    /// Never fails: missing state yields [`UNKNOWN_SCRIPT`] and diff errors
    /// are rendered as text.
    pub async fn diff_chain(&self, run: &Run) -> String {
        match self.try_diff_chain(run).await {
            Ok(text) => text,
            Err(e) => format!("{e:?}"),
        }
    }

    async fn try_diff_chain(&self, run: &Run) -> Result<String> {
        let root = find_root(self.runs.as_ref(), run, self.config.max_lineage_hops).await;
        let Some(old) = self.sources.state(&root).await else {
            return Ok(UNKNOWN_SCRIPT.to_string());
        };
        let Some(new) = self.sources.state(run).await else {
            return Ok(UNKNOWN_SCRIPT.to_string());
        };

        let context = self.config.diff_context;
        let mut out = diff_one(
            &self.config.main_script_label,
            &old.main_script,
            &new.main_script,
            context,
        )?;
        for (name, text) in &new.loaded_scripts {
            if let Some(previous) = old.loaded_scripts.get(name) {
                out.push_str(&diff_one(name, previous, text, context)?);
            }
        }
        Ok(out)
    }
}
