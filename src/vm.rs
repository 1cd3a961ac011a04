//! Tick interpreter over [`ExecutionState`].
//!
//! Script faults end the run with [`TickOutcome::Failed`]. A failed write to
//! the execution store is not the script's fault: the tick is rolled back and
//! the error returned, so the same tick runs again on the next resume.

use crate::compiler::{compile, CompiledProgram, Instr};
use crate::dispatch::{intercepts, resolve_on_script, AmbientMethods, OwnerCall};
use crate::events::ExecutionEvent;
use crate::state::*;
use crate::steps::{StepLibrary, StepResult};
use crate::store::ExecutionStore;
use crate::types::RunId;
use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// An execution store write failed while a tick or completion was applied.
#[derive(Debug, thiserror::Error)]
#[error("execution store write failed: {0}")]
pub struct StoreFailure(anyhow::Error);

/// Result of a single VM tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Plain local computation; tick again.
    Continue,
    /// A closure call was recorded as a pending forward. Suspension point:
    /// persist before ticking again.
    Forwarded,
    /// A new auxiliary script was recorded; persist so readers see it.
    ScriptLoaded(String),
    /// Parked on a step invocation. Suspension point.
    Parked(StepCall),
    Completed,
    Failed(String),
}

impl TickOutcome {
    /// True when the state must be saved before execution continues.
    pub fn is_suspension_point(&self) -> bool {
        !matches!(self, TickOutcome::Continue)
    }
}

// ─── Programs ─────────────────────────────────────────────────

/// Compiled form of every script a state references. Rebuilt on resume.
pub struct Programs {
    main: CompiledProgram,
    loaded: BTreeMap<String, CompiledProgram>,
}

impl Programs {
    pub fn for_state(state: &ExecutionState) -> Result<Self> {
        let main = compile(&state.main_script).map_err(|e| anyhow!("main script: {e}"))?;
        let mut loaded = BTreeMap::new();
        for (name, text) in &state.loaded_scripts {
            let program = compile(text).map_err(|e| anyhow!("{name}: {e}"))?;
            loaded.insert(name.clone(), program);
        }
        Ok(Self { main, loaded })
    }

    pub fn get(&self, script: &ScriptRef) -> Result<&CompiledProgram> {
        match script {
            ScriptRef::Main => Ok(&self.main),
            ScriptRef::Loaded(name) => self
                .loaded
                .get(name)
                .ok_or_else(|| anyhow!("script '{name}' is not loaded")),
        }
    }

    fn add_loaded(&mut self, name: &str, text: &str) -> Result<()> {
        if !self.loaded.contains_key(name) {
            let program = compile(text).map_err(|e| anyhow!("{name}: {e}"))?;
            self.loaded.insert(name.to_string(), program);
        }
        Ok(())
    }
}

// ─── VM ───────────────────────────────────────────────────────

/// Executes script frames of one [`ExecutionState`] at a time.
pub struct Vm {
    store: Arc<dyn ExecutionStore>,
    steps: Arc<dyn StepLibrary>,
    ambient: Arc<dyn AmbientMethods>,
}

impl Vm {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        steps: Arc<dyn StepLibrary>,
        ambient: Arc<dyn AmbientMethods>,
    ) -> Self {
        Self {
            store,
            steps,
            ambient,
        }
    }

    /// Execute one instruction, or resolve one pending forward.
    ///
    /// Script-level faults (unknown method, undefined variable, bad load)
    /// fail the run and are reported as [`TickOutcome::Failed`]. A
    /// [`StoreFailure`] restores `state` to what it was before the tick and
    /// is returned as the error.
    pub async fn tick(
        &self,
        state: &mut ExecutionState,
        programs: &mut Programs,
    ) -> Result<TickOutcome> {
        match &state.status {
            ExecutionStatus::Completed => return Ok(TickOutcome::Completed),
            ExecutionStatus::Failed { message } => return Ok(TickOutcome::Failed(message.clone())),
            ExecutionStatus::Running => {}
        }
        let before = state.clone();
        let outcome = match self.exec(state, programs).await {
            Err(e) if !e.is::<StoreFailure>() => self.fail(state, format!("{e:#}")).await,
            other => other,
        };
        if outcome.is_err() {
            *state = before;
        }
        outcome
    }

    /// Tick until a suspension point or `max_ticks` plain ticks.
    pub async fn run(
        &self,
        state: &mut ExecutionState,
        programs: &mut Programs,
        max_ticks: usize,
    ) -> Result<TickOutcome> {
        for _ in 0..max_ticks {
            match self.tick(state, programs).await? {
                TickOutcome::Continue => continue,
                other => return Ok(other),
            }
        }
        Ok(TickOutcome::Continue)
    }

    async fn exec(
        &self,
        state: &mut ExecutionState,
        programs: &mut Programs,
    ) -> Result<TickOutcome> {
        match state.pending.take() {
            Some(PendingCall::Step(call)) => {
                state.pending = Some(PendingCall::Step(call.clone()));
                return Ok(TickOutcome::Parked(call));
            }
            Some(PendingCall::Forward {
                method,
                args,
                target,
            }) => return self.dispatch(state, programs, target, method, args).await,
            None => {}
        }

        if state.frames.is_empty() {
            return self.complete(state).await;
        }
        let frame = state
            .frames
            .last_mut()
            .ok_or_else(|| anyhow!("no frame to execute"))?;
        let program = programs.get(&frame.script)?;
        let pc = frame.pc;
        let instr = program.program.get(pc as usize).cloned().ok_or_else(|| {
            anyhow!(
                "pc {pc} out of bounds in {} (len {})",
                frame.script,
                program.program.len()
            )
        })?;
        let line = program.line_of(pc);

        match instr {
            Instr::PushNull => push(frame, Value::Null),
            Instr::PushBool(b) => push(frame, Value::Bool(b)),
            Instr::PushI64(n) => push(frame, Value::I64(n)),
            Instr::PushStr(s) => push(frame, Value::Str(s)),

            Instr::Load { name } => {
                let value = frame.locals.get(&name).cloned().ok_or_else(|| {
                    anyhow!("No such property: {name}{}", at_line(line))
                })?;
                push(frame, value)
            }

            Instr::Store { name } => {
                let value = frame
                    .stack
                    .pop()
                    .ok_or_else(|| anyhow!("Store: stack underflow"))?;
                frame.locals.insert(name, value);
                frame.pc += 1;
                Ok(TickOutcome::Continue)
            }

            Instr::Pop => {
                frame.stack.pop();
                frame.pc += 1;
                Ok(TickOutcome::Continue)
            }

            Instr::MakeClosure { closure } => {
                let plan = program
                    .closures
                    .get(closure as usize)
                    .cloned()
                    .ok_or_else(|| anyhow!("MakeClosure: no closure {closure}"))?;
                let value = Value::Closure(ClosureValue {
                    script: frame.script.clone(),
                    entry: plan.entry,
                    params: plan.params,
                    owner: Box::new(frame.receiver.clone()),
                    capture: frame.locals.clone(),
                });
                push(frame, value)
            }

            Instr::Invoke { method, argc } => {
                let at = frame
                    .stack
                    .len()
                    .checked_sub(argc as usize)
                    .ok_or_else(|| anyhow!("Invoke {method}: stack underflow"))?;
                let args = frame.stack.split_off(at);
                let receiver = frame.receiver.clone();
                // pc stays on the call site until the call resolves
                self.dispatch(state, programs, receiver, method, args)
                    .await
                    .map_err(|e| {
                        if e.is::<StoreFailure>() {
                            e
                        } else {
                            anyhow!("{e}{}", at_line(line))
                        }
                    })
            }

            Instr::Return | Instr::End => self.pop_frame(state).await,
        }
    }

    /// Route a call made with `receiver` as the implicit target.
    async fn dispatch(
        &self,
        state: &mut ExecutionState,
        programs: &mut Programs,
        receiver: Receiver,
        method: String,
        args: Vec<Value>,
    ) -> Result<TickOutcome> {
        match receiver {
            Receiver::Closure(closure) => {
                let argc = args.len();
                if intercepts(&method, argc).is_none() && self.ambient.has(&method, argc) {
                    let this = Receiver::Closure(closure);
                    let value = self.ambient.invoke(&this, &method, &args)?;
                    self.record(&state.run, ExecutionEvent::AmbientInvoked { method, argc })
                        .await?;
                    finish_call(state, value)?;
                    return Ok(TickOutcome::Continue);
                }

                let from = Receiver::Closure(closure.clone()).describe();
                let target = *closure.owner;
                debug!(run = %state.run, %method, argc, %from, to = %target.describe(), "forwarding closure call to owner");
                self.record(
                    &state.run,
                    ExecutionEvent::Forwarded {
                        method: method.clone(),
                        argc,
                        from,
                        to: target.describe(),
                    },
                )
                .await?;
                state.pending = Some(PendingCall::Forward {
                    method,
                    args,
                    target,
                });
                Ok(TickOutcome::Forwarded)
            }

            Receiver::Script => match resolve_on_script(&method, args)? {
                OwnerCall::Load { name } => self.load_script(state, programs, &name).await,
                OwnerCall::Step { step, args } => self.invoke_step(state, step, args).await,
            },
        }
    }

    async fn invoke_step(
        &self,
        state: &mut ExecutionState,
        step: String,
        mut args: Vec<Value>,
    ) -> Result<TickOutcome> {
        let descriptor = self
            .steps
            .descriptor(&step)
            .ok_or_else(|| anyhow!("No such DSL method '{step}' found among steps"))?;

        let body = match args.last() {
            Some(Value::Closure(_)) if descriptor.takes_body => match args.pop() {
                Some(Value::Closure(c)) => Some(c),
                _ => None,
            },
            _ => None,
        };

        let call = StepCall {
            call_id: Uuid::now_v7().to_string(),
            step,
            args,
            body,
        };
        state.step_seq += 1;
        self.record(
            &state.run,
            ExecutionEvent::StepInvoked {
                call_id: call.call_id.clone(),
                step: call.step.clone(),
                argc: call.args.len(),
            },
        )
        .await?;
        state.pending = Some(PendingCall::Step(call.clone()));
        Ok(TickOutcome::Parked(call))
    }

    async fn load_script(
        &self,
        state: &mut ExecutionState,
        programs: &mut Programs,
        name: &str,
    ) -> Result<TickOutcome> {
        let text = match state.loaded_scripts.get(name) {
            Some(text) => text.clone(),
            None => state
                .sources
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("No such script '{name}' to load"))?,
        };
        programs.add_loaded(name, &text)?;

        if !state.loaded_scripts.contains_key(name) {
            self.record(
                &state.run,
                ExecutionEvent::ScriptLoaded {
                    name: name.to_string(),
                    digest: digest(&text),
                },
            )
            .await?;
            state.record_loaded(name, &text);
        }

        let caller = state
            .frames
            .last_mut()
            .ok_or_else(|| anyhow!("load: no calling frame"))?;
        caller.pc += 1;
        state
            .frames
            .push(Frame::script_body(ScriptRef::Loaded(name.to_string())));
        Ok(TickOutcome::ScriptLoaded(name.to_string()))
    }

    /// Resume a run parked on `call_id`.
    ///
    /// Returns `false` (and records nothing but an audit event) when the run
    /// is not parked on that call. On error `state` is left as it was.
    pub async fn complete_step(
        &self,
        state: &mut ExecutionState,
        call_id: &str,
        result: StepResult,
    ) -> Result<bool> {
        let before = state.clone();
        let applied = self.apply_completion(state, call_id, result).await;
        if applied.is_err() {
            *state = before;
        }
        applied
    }

    async fn apply_completion(
        &self,
        state: &mut ExecutionState,
        call_id: &str,
        result: StepResult,
    ) -> Result<bool> {
        let call = match state.pending.take() {
            Some(PendingCall::Step(call)) if call.call_id == call_id => call,
            other => {
                state.pending = other;
                self.record(
                    &state.run,
                    ExecutionEvent::StepCompletionIgnored {
                        call_id: call_id.to_string(),
                    },
                )
                .await?;
                return Ok(false);
            }
        };

        match result {
            StepResult::Value(value) => {
                finish_call(state, value)?;
                self.record(
                    &state.run,
                    ExecutionEvent::StepCompleted {
                        call_id: call.call_id,
                    },
                )
                .await?;
            }
            StepResult::RunBody => {
                let Some(body) = call.body else {
                    self.fail(state, format!("step '{}' has no body to run", call.step))
                        .await?;
                    return Ok(true);
                };
                let caller = state
                    .frames
                    .last_mut()
                    .ok_or_else(|| anyhow!("RunBody: no calling frame"))?;
                caller.pc += 1;
                state.frames.push(Frame::closure_body(&body, Vec::new()));
                self.record(
                    &state.run,
                    ExecutionEvent::BodyStarted {
                        call_id: call.call_id,
                    },
                )
                .await?;
            }
            StepResult::Failed(message) => {
                self.fail(state, message).await?;
            }
        }
        Ok(true)
    }

    async fn pop_frame(&self, state: &mut ExecutionState) -> Result<TickOutcome> {
        state.frames.pop();
        match state.frames.last_mut() {
            Some(caller) => {
                caller.stack.push(Value::Null);
                Ok(TickOutcome::Continue)
            }
            None => self.complete(state).await,
        }
    }

    async fn complete(&self, state: &mut ExecutionState) -> Result<TickOutcome> {
        state.status = ExecutionStatus::Completed;
        state.pending = None;
        self.record(&state.run, ExecutionEvent::Completed).await?;
        Ok(TickOutcome::Completed)
    }

    async fn fail(&self, state: &mut ExecutionState, message: String) -> Result<TickOutcome> {
        warn!(run = %state.run, %message, "run failed");
        state.status = ExecutionStatus::Failed {
            message: message.clone(),
        };
        state.pending = None;
        self.record(
            &state.run,
            ExecutionEvent::Failed {
                message: message.clone(),
            },
        )
        .await?;
        Ok(TickOutcome::Failed(message))
    }

    async fn record(&self, run: &RunId, event: ExecutionEvent) -> Result<()> {
        self.store
            .append_event(run, &event)
            .await
            .map_err(StoreFailure)?;
        Ok(())
    }
}

fn push(frame: &mut Frame, value: Value) -> Result<TickOutcome> {
    frame.stack.push(value);
    frame.pc += 1;
    Ok(TickOutcome::Continue)
}

/// Deliver a call's result to the call site and move past it.
fn finish_call(state: &mut ExecutionState, value: Value) -> Result<()> {
    let frame = state
        .frames
        .last_mut()
        .ok_or_else(|| anyhow!("call completed with no calling frame"))?;
    frame.stack.push(value);
    frame.pc += 1;
    Ok(())
}

fn at_line(line: Option<usize>) -> String {
    line.map(|l| format!(" (line {l})")).unwrap_or_default()
}

/// Hex SHA-256 of a script text.
pub fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StandardAmbient;
    use crate::steps::StepCatalog;
    use crate::store_memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct CatalogSteps(StepCatalog);

    #[async_trait]
    impl StepLibrary for CatalogSteps {
        fn descriptor(&self, name: &str) -> Option<crate::steps::StepDescriptor> {
            self.0.get(name).cloned()
        }

        async fn execute(&self, _call: &StepCall) -> Result<StepResult> {
            Ok(StepResult::Value(Value::Null))
        }
    }

    /// Host defaults that only record what reached them.
    #[derive(Default)]
    struct RecordingAmbient {
        calls: Mutex<Vec<String>>,
    }

    impl AmbientMethods for RecordingAmbient {
        fn has(&self, method: &str, argc: usize) -> bool {
            StandardAmbient.has(method, argc)
        }

        fn invoke(&self, receiver: &Receiver, method: &str, args: &[Value]) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{method}/{}", args.len()));
            Ok(Value::Str(receiver.describe()))
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RecordingAmbient>, Vm) {
        let store = Arc::new(MemoryStore::new());
        let ambient = Arc::new(RecordingAmbient::default());
        let vm = Vm::new(
            store.clone(),
            Arc::new(CatalogSteps(StepCatalog::basic().with_block_step("closure"))),
            ambient.clone(),
        );
        (store, ambient, vm)
    }

    fn make_state(main: &str) -> ExecutionState {
        ExecutionState::new(RunId::new("vm", 1), main.to_string(), BTreeMap::new(), true)
    }

    async fn run_until_parked(
        vm: &Vm,
        state: &mut ExecutionState,
        programs: &mut Programs,
    ) -> TickOutcome {
        loop {
            match vm.run(state, programs, 100).await.unwrap() {
                TickOutcome::Forwarded | TickOutcome::ScriptLoaded(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_script_println_becomes_echo_step() {
        let (_, ambient, vm) = setup();
        let mut state = make_state("println 'hi'");
        let mut programs = Programs::for_state(&state).unwrap();

        let outcome = run_until_parked(&vm, &mut state, &mut programs).await;
        let TickOutcome::Parked(call) = outcome else {
            panic!("expected park, got {outcome:?}");
        };
        assert_eq!(call.step, "echo");
        assert_eq!(call.args, vec![Value::Str("hi".into())]);
        assert!(ambient.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closure_intercepted_calls_forward_to_owner() {
        for (line, argc) in [
            ("sleep 3", 1usize),
            ("println", 0),
            ("println 'x'", 1),
            ("print 'x'", 1),
            ("printf('%s!', 'x')", 2),
        ] {
            let (store, ambient, vm) = setup();
            let mut state = make_state(&format!("closure {{\n  {line}\n}}"));
            let mut programs = Programs::for_state(&state).unwrap();

            // Park on the outer block step, then run its body.
            let TickOutcome::Parked(outer) = run_until_parked(&vm, &mut state, &mut programs).await
            else {
                panic!("expected block step park");
            };
            vm.complete_step(&mut state, &outer.call_id, StepResult::RunBody)
                .await
                .unwrap();

            // The first suspension inside the body is the forward itself.
            let outcome = vm.run(&mut state, &mut programs, 100).await.unwrap();
            assert_eq!(outcome, TickOutcome::Forwarded, "{line}");
            match &state.pending {
                Some(PendingCall::Forward {
                    args, target, ..
                }) => {
                    assert_eq!(args.len(), argc, "{line}");
                    assert_eq!(*target, Receiver::Script);
                }
                other => panic!("expected pending forward, got {other:?}"),
            }

            let outcome = run_until_parked(&vm, &mut state, &mut programs).await;
            assert!(matches!(outcome, TickOutcome::Parked(_)), "{line}");
            assert!(ambient.calls.lock().unwrap().is_empty(), "{line}");

            let events = store.read_events(&state.run, 1).await.unwrap();
            assert!(events
                .iter()
                .any(|(_, e)| matches!(e, ExecutionEvent::Forwarded { argc: a, .. } if *a == argc)));
        }
    }

    #[tokio::test]
    async fn test_forward_preserves_argument_order() {
        let (_, _, vm) = setup();
        let mut state = make_state("closure {\n  printf('%d%%', 7)\n}");
        let mut programs = Programs::for_state(&state).unwrap();
        let TickOutcome::Parked(outer) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        vm.complete_step(&mut state, &outer.call_id, StepResult::RunBody)
            .await
            .unwrap();
        vm.run(&mut state, &mut programs, 100).await.unwrap();
        let Some(PendingCall::Forward { method, args, .. }) = &state.pending else {
            panic!("expected forward");
        };
        assert_eq!(method, "printf");
        assert_eq!(args, &vec![Value::Str("%d%%".into()), Value::I64(7)]);

        let TickOutcome::Parked(echo) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected echo park");
        };
        assert_eq!(echo.step, "echo");
        assert_eq!(echo.args, vec![Value::Str("7%".into())]);
    }

    #[tokio::test]
    async fn test_nested_closures_forward_once_per_level() {
        let (store, _, vm) = setup();
        let mut state = make_state("closure {\n  closure {\n    println 'deep'\n  }\n}");
        let mut programs = Programs::for_state(&state).unwrap();

        let mut forwards = 0;
        loop {
            match vm.run(&mut state, &mut programs, 100).await.unwrap() {
                TickOutcome::Forwarded => forwards += 1,
                TickOutcome::Parked(call) if call.step == "closure" => {
                    vm.complete_step(&mut state, &call.call_id, StepResult::RunBody)
                        .await
                        .unwrap();
                }
                TickOutcome::Parked(call) => {
                    assert_eq!(call.step, "echo");
                    assert_eq!(call.args, vec![Value::Str("deep".into())]);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        // inner `closure` call: 1 hop; println: inner -> outer -> script = 2 hops
        assert_eq!(forwards, 3);
        let events = store.read_events(&state.run, 1).await.unwrap();
        let hops: Vec<_> = events
            .iter()
            .filter_map(|(_, e)| match e {
                ExecutionEvent::Forwarded { method, to, .. } if method == "println" => {
                    Some(to.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[1], "script");
    }

    #[tokio::test]
    async fn test_non_intercepted_host_default_is_used_in_closure() {
        let (_, ambient, vm) = setup();
        let mut state = make_state("closure {\n  toString\n}");
        let mut programs = Programs::for_state(&state).unwrap();
        let TickOutcome::Parked(outer) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        vm.complete_step(&mut state, &outer.call_id, StepResult::RunBody)
            .await
            .unwrap();
        let outcome = run_until_parked(&vm, &mut state, &mut programs).await;
        assert_eq!(outcome, TickOutcome::Completed);
        assert_eq!(*ambient.calls.lock().unwrap(), vec!["toString/0".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_method_fails_run() {
        let (_, _, vm) = setup();
        let mut state = make_state("\nfrobnicate 'x'");
        let mut programs = Programs::for_state(&state).unwrap();
        let outcome = run_until_parked(&vm, &mut state, &mut programs).await;
        let TickOutcome::Failed(message) = outcome else {
            panic!("expected failure");
        };
        assert!(message.contains("No such DSL method 'frobnicate'"));
        assert!(message.contains("line 2"));
        assert!(state.status.is_terminal());
    }

    #[tokio::test]
    async fn test_load_records_script_and_runs_it() {
        let (_, _, vm) = setup();
        let mut state = ExecutionState::new(
            RunId::new("vm", 1),
            "load 'lib'\necho 'main'".to_string(),
            BTreeMap::from([("lib".to_string(), "echo 'from lib'".to_string())]),
            true,
        );
        let mut programs = Programs::for_state(&state).unwrap();

        let outcome = vm.run(&mut state, &mut programs, 100).await.unwrap();
        assert_eq!(outcome, TickOutcome::ScriptLoaded("lib".into()));
        assert_eq!(
            state.loaded_scripts.get("lib").map(String::as_str),
            Some("echo 'from lib'")
        );

        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        assert_eq!(call.args, vec![Value::Str("from lib".into())]);
        vm.complete_step(&mut state, &call.call_id, StepResult::Value(Value::Null))
            .await
            .unwrap();

        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        assert_eq!(call.args, vec![Value::Str("main".into())]);
    }

    #[tokio::test]
    async fn test_pending_forward_survives_serialization() {
        let (_, _, vm) = setup();
        let mut state = make_state("closure {\n  sleep 10\n}");
        let mut programs = Programs::for_state(&state).unwrap();
        let TickOutcome::Parked(outer) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        vm.complete_step(&mut state, &outer.call_id, StepResult::RunBody)
            .await
            .unwrap();
        assert_eq!(
            vm.run(&mut state, &mut programs, 100).await.unwrap(),
            TickOutcome::Forwarded
        );

        // Simulated restart: only the serialized state crosses over.
        let json = serde_json::to_string(&state).unwrap();
        drop(programs);
        let mut restored: ExecutionState = serde_json::from_str(&json).unwrap();
        let mut programs = Programs::for_state(&restored).unwrap();

        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut restored, &mut programs).await
        else {
            panic!("expected sleep park");
        };
        assert_eq!(call.step, "sleep");
        assert_eq!(call.args, vec![Value::I64(10)]);
    }

    #[tokio::test]
    async fn test_completion_for_unknown_call_is_ignored() {
        let (_, _, vm) = setup();
        let mut state = make_state("echo 'a'");
        let mut programs = Programs::for_state(&state).unwrap();
        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        let applied = vm
            .complete_step(&mut state, "nope", StepResult::Value(Value::Null))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(state.waiting_on(), Some(&call));
    }

    /// Execution store whose event log can be taken offline.
    #[derive(Default)]
    struct FlakyLog {
        inner: MemoryStore,
        offline: AtomicBool,
    }

    #[async_trait]
    impl ExecutionStore for FlakyLog {
        async fn save_execution(&self, state: &ExecutionState) -> Result<()> {
            self.inner.save_execution(state).await
        }

        async fn load_execution(&self, run: &RunId) -> Result<Option<ExecutionState>> {
            self.inner.load_execution(run).await
        }

        async fn delete_execution(&self, run: &RunId) -> Result<()> {
            self.inner.delete_execution(run).await
        }

        async fn append_event(&self, run: &RunId, event: &ExecutionEvent) -> Result<u64> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(anyhow!("event log offline"));
            }
            self.inner.append_event(run, event).await
        }

        async fn read_events(&self, run: &RunId, from_seq: u64) -> Result<Vec<(u64, ExecutionEvent)>> {
            self.inner.read_events(run, from_seq).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_tick_and_keeps_run_alive() {
        let log = Arc::new(FlakyLog::default());
        let vm = Vm::new(
            log.clone(),
            Arc::new(CatalogSteps(StepCatalog::basic())),
            Arc::new(StandardAmbient),
        );
        let mut state = ExecutionState::new(
            RunId::new("vm", 1),
            "load 'lib'\necho 'main'".to_string(),
            BTreeMap::from([("lib".to_string(), "echo 'from lib'".to_string())]),
            true,
        );
        let mut programs = Programs::for_state(&state).unwrap();

        // Push the script name, leaving the `load` call as the next tick.
        assert_eq!(
            vm.tick(&mut state, &mut programs).await.unwrap(),
            TickOutcome::Continue
        );
        let snapshot = serde_json::to_value(&state).unwrap();

        log.offline.store(true, Ordering::SeqCst);
        let err = vm.tick(&mut state, &mut programs).await.unwrap_err();
        assert!(err.is::<StoreFailure>(), "{err:#}");
        assert_eq!(serde_json::to_value(&state).unwrap(), snapshot);
        assert_eq!(state.status, ExecutionStatus::Running);
        assert!(state.loaded_scripts.is_empty());

        log.offline.store(false, Ordering::SeqCst);
        assert_eq!(
            vm.tick(&mut state, &mut programs).await.unwrap(),
            TickOutcome::ScriptLoaded("lib".into())
        );
        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        assert_eq!(call.args, vec![Value::Str("from lib".into())]);

        log.offline.store(true, Ordering::SeqCst);
        assert!(vm
            .complete_step(&mut state, &call.call_id, StepResult::Value(Value::Null))
            .await
            .is_err());
        assert_eq!(state.waiting_on(), Some(&call));
    }

    #[tokio::test]
    async fn test_step_failure_fails_run() {
        let (_, _, vm) = setup();
        let mut state = make_state("echo 'a'\necho 'b'");
        let mut programs = Programs::for_state(&state).unwrap();
        let TickOutcome::Parked(call) = run_until_parked(&vm, &mut state, &mut programs).await
        else {
            panic!("expected park");
        };
        vm.complete_step(&mut state, &call.call_id, StepResult::Failed("boom".into()))
            .await
            .unwrap();
        assert_eq!(
            state.status,
            ExecutionStatus::Failed {
                message: "boom".into()
            }
        );
        assert_eq!(
            vm.tick(&mut state, &mut programs).await.unwrap(),
            TickOutcome::Failed("boom".into())
        );
    }
}
