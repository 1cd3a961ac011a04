//! Pipeline engine
//!
//! Owns the persisted [`ExecutionState`] of every run and drives it through
//! the [`Vm`]. Every suspension point the VM reports is saved before the
//! engine ticks again, so a process that stops at any point resumes from
//! the last forward, load, or parked step.

use crate::config::EngineConfig;
use crate::dispatch::AmbientMethods;
use crate::events::ExecutionEvent;
use crate::state::{ExecutionState, ExecutionStatus, StepCall};
use crate::steps::{StepLibrary, StepResult};
use crate::store::{ExecutionOwner, ExecutionStore};
use crate::types::{JobDefinition, Run, RunAction, RunActionKind, RunId};
use crate::vm::{digest, Programs, TickOutcome, Vm};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Where a run stands after the engine stopped ticking it.
#[derive(Debug, Clone, PartialEq)]
pub enum RunProgress {
    /// Parked on a step; complete it to continue.
    Waiting(StepCall),
    Completed,
    Failed(String),
    /// Tick budget exhausted; call `resume` again.
    Yielded,
}

impl RunProgress {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunProgress::Completed | RunProgress::Failed(_))
    }
}

pub struct PipelineEngine {
    executions: Arc<dyn ExecutionStore>,
    steps: Arc<dyn StepLibrary>,
    vm: Vm,
    config: EngineConfig,
    /// One async lock per run; operations on different runs never contend.
    /// An entry lives only while some operation holds or awaits it.
    run_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl PipelineEngine {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        steps: Arc<dyn StepLibrary>,
        ambient: Arc<dyn AmbientMethods>,
        config: EngineConfig,
    ) -> Self {
        let vm = Vm::new(executions.clone(), steps.clone(), ambient);
        Self {
            executions,
            steps,
            vm,
            config,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn run_lock(&self, run: &RunId) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks.entry(run.clone()).or_default().clone()
    }

    /// Drop the map entry for `run` unless another operation still holds a
    /// handle to its lock.
    async fn release_lock(&self, run: &RunId, lock: Arc<Mutex<()>>) {
        let mut locks = self.run_locks.lock().await;
        // the map's handle plus ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(run);
        }
    }

    /// Create the execution state of a freshly scheduled run and tick it to
    /// its first suspension point.
    ///
    /// A run carrying a `ReplayFlowFactory` action executes the replacement
    /// scripts it names; any other run executes `job`.
    pub async fn start(&self, run: &Run, job: &JobDefinition) -> Result<RunProgress> {
        let lock = self.run_lock(&run.id).await;
        let progress = {
            let _guard = lock.lock().await;
            self.start_locked(run, job).await
        };
        self.release_lock(&run.id, lock).await;
        progress
    }

    async fn start_locked(&self, run: &Run, job: &JobDefinition) -> Result<RunProgress> {
        let mut state = initial_state(run, job);
        let replay_of = run.replay_of().cloned();
        info!(
            run = %run.id,
            sandbox = state.sandbox,
            replay_of = ?replay_of,
            "starting run"
        );
        self.executions
            .append_event(
                &run.id,
                &ExecutionEvent::Started {
                    run: run.id.clone(),
                    sandbox: state.sandbox,
                    main_digest: digest(&state.main_script),
                    replay_of,
                },
            )
            .await?;
        self.executions.save_execution(&state).await?;
        self.advance(&mut state).await
    }

    /// Tick a run until it parks, finishes, or uses up its tick budget.
    pub async fn resume(&self, run: &RunId) -> Result<RunProgress> {
        let lock = self.run_lock(run).await;
        let progress = {
            let _guard = lock.lock().await;
            match self.load(run).await {
                Ok(mut state) => self.advance(&mut state).await,
                Err(e) => Err(e),
            }
        };
        self.release_lock(run, lock).await;
        progress
    }

    /// Deliver the result of a parked step. Returns `false` when the run is
    /// not parked on `call_id`.
    pub async fn complete_step(
        &self,
        run: &RunId,
        call_id: &str,
        result: StepResult,
    ) -> Result<bool> {
        let lock = self.run_lock(run).await;
        let applied = {
            let _guard = lock.lock().await;
            self.complete_locked(run, call_id, result).await
        };
        self.release_lock(run, lock).await;
        applied
    }

    async fn complete_locked(
        &self,
        run: &RunId,
        call_id: &str,
        result: StepResult,
    ) -> Result<bool> {
        let mut state = self.load(run).await?;
        let applied = self.vm.complete_step(&mut state, call_id, result).await?;
        if applied {
            self.executions.save_execution(&state).await?;
        }
        Ok(applied)
    }

    /// Alternate `resume` with step execution until the run finishes.
    pub async fn drive(&self, run: &RunId) -> Result<RunProgress> {
        for _ in 0..self.config.max_drive_rounds {
            match self.resume(run).await? {
                RunProgress::Waiting(call) => {
                    let result = match self.steps.execute(&call).await {
                        Ok(result) => result,
                        Err(e) => StepResult::Failed(format!("{e:#}")),
                    };
                    self.complete_step(run, &call.call_id, result).await?;
                }
                RunProgress::Yielded => tokio::task::yield_now().await,
                finished => return Ok(finished),
            }
        }
        Ok(RunProgress::Yielded)
    }

    /// Current persisted state of a run, if any.
    pub async fn state(&self, run: &RunId) -> Result<Option<ExecutionState>> {
        self.executions.load_execution(run).await
    }

    async fn load(&self, run: &RunId) -> Result<ExecutionState> {
        self.executions
            .load_execution(run)
            .await?
            .ok_or_else(|| anyhow!("no execution state for run {run}"))
    }

    async fn advance(&self, state: &mut ExecutionState) -> Result<RunProgress> {
        let mut programs = match Programs::for_state(state) {
            Ok(programs) => programs,
            Err(e) => return self.fail_unstartable(state, format!("{e:#}")).await,
        };

        for _ in 0..self.config.max_ticks_per_resume {
            let outcome = self.vm.tick(state, &mut programs).await?;
            if outcome.is_suspension_point() {
                self.executions.save_execution(state).await?;
            }
            match outcome {
                TickOutcome::Continue | TickOutcome::Forwarded | TickOutcome::ScriptLoaded(_) => {}
                TickOutcome::Parked(call) => return Ok(RunProgress::Waiting(call)),
                TickOutcome::Completed => {
                    info!(run = %state.run, steps = state.step_seq, "run completed");
                    return Ok(RunProgress::Completed);
                }
                TickOutcome::Failed(message) => return Ok(RunProgress::Failed(message)),
            }
        }
        self.executions.save_execution(state).await?;
        Ok(RunProgress::Yielded)
    }

    /// Fail a run whose scripts cannot be compiled.
    async fn fail_unstartable(
        &self,
        state: &mut ExecutionState,
        message: String,
    ) -> Result<RunProgress> {
        warn!(run = %state.run, %message, "run cannot execute its scripts");
        state.status = ExecutionStatus::Failed {
            message: message.clone(),
        };
        state.pending = None;
        self.executions
            .append_event(
                &state.run,
                &ExecutionEvent::Failed {
                    message: message.clone(),
                },
            )
            .await?;
        self.executions.save_execution(state).await?;
        Ok(RunProgress::Failed(message))
    }
}

#[async_trait]
impl ExecutionOwner for PipelineEngine {
    async fn resolve_resumable_state(&self, run: &Run) -> Result<Option<ExecutionState>> {
        self.executions.load_execution(&run.id).await
    }
}

fn initial_state(run: &Run, job: &JobDefinition) -> ExecutionState {
    let factory = run
        .actions_of(RunActionKind::ReplayFlowFactory)
        .find_map(|action| match action {
            RunAction::ReplayFlowFactory {
                main_script,
                loaded_scripts,
                sandbox,
            } => Some((main_script, loaded_scripts, *sandbox)),
            _ => None,
        });

    match factory {
        Some((main_script, replacements, sandbox)) => {
            let mut sources = job.library.clone();
            sources.extend(replacements.iter().map(|(k, v)| (k.clone(), v.clone())));
            ExecutionState::new(run.id.clone(), main_script.clone(), sources, sandbox)
        }
        None => ExecutionState::new(
            run.id.clone(),
            job.main_script.clone(),
            job.library.clone(),
            job.sandbox,
        ),
    }
}
