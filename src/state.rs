//! Execution State Types
//!
//! Everything a suspended run needs to continue after a process restart.
//! Compiled programs are deliberately absent: they are rebuilt from the
//! recorded script texts, so only texts, frames and the pending call are
//! persisted.

use crate::types::{Addr, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Value ────────────────────────────────────────────────────

/// A script-level value on a frame's operand stack or in its bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    Str(String),
    Closure(ClosureValue),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Closure(c) => write!(f, "closure@{}:{}", c.script, c.entry),
        }
    }
}

// ─── Script references ────────────────────────────────────────

/// Which recorded script text a frame executes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScriptRef {
    Main,
    Loaded(String),
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptRef::Main => f.write_str("main"),
            ScriptRef::Loaded(name) => f.write_str(name),
        }
    }
}

// ─── Receivers and closures ───────────────────────────────────

/// The object a frame's unqualified calls are addressed to.
///
/// Suspend/resume state is anchored to the owner chain, so a closure keeps
/// the receiver that created it rather than a reference to a live frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Receiver {
    /// The enclosing script instance.
    Script,
    Closure(Box<ClosureValue>),
}

impl Receiver {
    pub fn describe(&self) -> String {
        match self {
            Receiver::Script => "script".to_string(),
            Receiver::Closure(c) => format!("closure@{}:{}", c.script, c.entry),
        }
    }
}

/// A deferred block of script logic bound to its owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosureValue {
    pub script: ScriptRef,
    pub entry: Addr,
    pub params: Vec<String>,
    pub owner: Box<Receiver>,
    /// Bindings visible where the closure was created.
    pub capture: BTreeMap<String, Value>,
}

// ─── Frames ───────────────────────────────────────────────────

/// One activation on the run's call stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub script: ScriptRef,
    pub pc: Addr,
    pub receiver: Receiver,
    pub locals: BTreeMap<String, Value>,
    pub stack: Vec<Value>,
}

impl Frame {
    pub fn script_body(script: ScriptRef) -> Self {
        Self {
            script,
            pc: 0,
            receiver: Receiver::Script,
            locals: BTreeMap::new(),
            stack: Vec::new(),
        }
    }

    pub fn closure_body(closure: &ClosureValue, args: Vec<Value>) -> Self {
        let mut locals = closure.capture.clone();
        let mut args = args.into_iter();
        for param in &closure.params {
            locals.insert(param.clone(), args.next().unwrap_or(Value::Null));
        }
        Self {
            script: closure.script.clone(),
            pc: closure.entry,
            receiver: Receiver::Closure(Box::new(closure.clone())),
            locals,
            stack: Vec::new(),
        }
    }
}

// ─── Pending calls (suspension points) ────────────────────────

/// A step invocation the run is parked on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepCall {
    pub call_id: String,
    pub step: String,
    pub args: Vec<Value>,
    /// Block argument for steps that take a body.
    pub body: Option<ClosureValue>,
}

/// A call that has been issued but not yet resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PendingCall {
    /// Closure call being forwarded to `target`; resolved on the next tick.
    Forward {
        method: String,
        args: Vec<Value>,
        target: Receiver,
    },
    /// Parked until the step library completes it.
    Step(StepCall),
}

// ─── Execution state ──────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed { message: String },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Resumable execution state of one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run: RunId,
    pub main_script: String,
    /// Scripts loaded so far. Names are only ever appended.
    pub loaded_scripts: BTreeMap<String, String>,
    /// Texts available to `load`, keyed by name.
    pub sources: BTreeMap<String, String>,
    pub sandbox: bool,
    pub frames: Vec<Frame>,
    pub pending: Option<PendingCall>,
    pub status: ExecutionStatus,
    /// Number of step invocations issued so far.
    pub step_seq: u64,
}

impl ExecutionState {
    pub fn new(
        run: RunId,
        main_script: String,
        sources: BTreeMap<String, String>,
        sandbox: bool,
    ) -> Self {
        Self {
            run,
            main_script,
            loaded_scripts: BTreeMap::new(),
            sources,
            sandbox,
            frames: vec![Frame::script_body(ScriptRef::Main)],
            pending: None,
            status: ExecutionStatus::Running,
            step_seq: 0,
        }
    }

    /// Record a loaded script. An already-recorded name keeps its first text.
    pub fn record_loaded(&mut self, name: &str, text: &str) -> bool {
        if self.loaded_scripts.contains_key(name) {
            return false;
        }
        self.loaded_scripts
            .insert(name.to_string(), text.to_string());
        true
    }

    pub fn waiting_on(&self) -> Option<&StepCall> {
        match &self.pending {
            Some(PendingCall::Step(call)) => Some(call),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closure(params: &[&str]) -> ClosureValue {
        ClosureValue {
            script: ScriptRef::Main,
            entry: 7,
            params: params.iter().map(|p| p.to_string()).collect(),
            owner: Box::new(Receiver::Script),
            capture: BTreeMap::from([("outer".to_string(), Value::I64(1))]),
        }
    }

    #[test]
    fn closure_frame_binds_params_over_capture() {
        let frame = Frame::closure_body(&closure(&["a", "b"]), vec![Value::Str("x".into())]);
        assert_eq!(frame.pc, 7);
        assert_eq!(frame.locals.get("outer"), Some(&Value::I64(1)));
        assert_eq!(frame.locals.get("a"), Some(&Value::Str("x".into())));
        assert_eq!(frame.locals.get("b"), Some(&Value::Null));
        assert!(matches!(frame.receiver, Receiver::Closure(_)));
    }

    #[test]
    fn loaded_scripts_are_append_only() {
        let mut state = ExecutionState::new(
            RunId::new("app", 1),
            "echo 'hi'".into(),
            BTreeMap::new(),
            true,
        );
        assert!(state.record_loaded("lib", "v1"));
        assert!(!state.record_loaded("lib", "v2"));
        assert_eq!(state.loaded_scripts.get("lib").map(String::as_str), Some("v1"));
    }

    #[test]
    fn state_survives_json_round_trip() {
        let mut state = ExecutionState::new(
            RunId::new("app", 1),
            "node {\n}".into(),
            BTreeMap::new(),
            false,
        );
        state.pending = Some(PendingCall::Forward {
            method: "println".into(),
            args: vec![Value::Str("x".into())],
            target: Receiver::Closure(Box::new(closure(&[]))),
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pending, state.pending);
        assert_eq!(back.frames.len(), 1);
    }
}
