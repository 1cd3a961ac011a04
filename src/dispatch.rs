//! Dispatch interception for closure calls.
//!
//! The host object model offers default methods (`sleep`, `println`, ...)
//! on every closure. Several of those names are also pipeline steps, and a
//! default would run natively, bypassing the step model and with it any
//! chance to suspend. Calls made inside a closure therefore consult the
//! closed [`INTERCEPTED`] table first; a hit is forwarded, arguments
//! unchanged, to the closure's owner.

use crate::state::{Receiver, Value};
use anyhow::{anyhow, bail, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

// ─── Intercepted operations ───────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterceptedOp {
    Sleep,
    PrintlnEmpty,
    Println,
    Print,
    Printf,
}

/// Names and arities routed to the owner ahead of any host default.
pub const INTERCEPTED: &[(&str, usize, InterceptedOp)] = &[
    ("sleep", 1, InterceptedOp::Sleep),
    ("println", 0, InterceptedOp::PrintlnEmpty),
    ("println", 1, InterceptedOp::Println),
    ("print", 1, InterceptedOp::Print),
    ("printf", 2, InterceptedOp::Printf),
];

pub fn intercepts(method: &str, argc: usize) -> Option<InterceptedOp> {
    INTERCEPTED
        .iter()
        .find(|(name, arity, _)| *name == method && *arity == argc)
        .map(|(_, _, op)| *op)
}

// ─── Host defaults ────────────────────────────────────────────

/// Default methods the host runtime makes available on every closure.
pub trait AmbientMethods: Send + Sync {
    fn has(&self, method: &str, argc: usize) -> bool;
    fn invoke(&self, receiver: &Receiver, method: &str, args: &[Value]) -> Result<Value>;
}

/// The stock host defaults: blocking sleep, stdout printing, `toString`.
///
/// None of these can suspend a run, which is why the intercepted names
/// never reach them.
pub struct StandardAmbient;

impl AmbientMethods for StandardAmbient {
    fn has(&self, method: &str, argc: usize) -> bool {
        matches!(
            (method, argc),
            ("sleep", 1) | ("println", 0) | ("println", 1) | ("print", 1) | ("printf", 2) | ("toString", 0)
        )
    }

    fn invoke(&self, receiver: &Receiver, method: &str, args: &[Value]) -> Result<Value> {
        match (method, args) {
            ("sleep", [Value::I64(ms)]) => {
                std::thread::sleep(Duration::from_millis((*ms).max(0) as u64));
                Ok(Value::Null)
            }
            ("println", []) => {
                println!();
                Ok(Value::Null)
            }
            ("println", [v]) => {
                println!("{v}");
                Ok(Value::Null)
            }
            ("print", [v]) => {
                print!("{v}");
                Ok(Value::Null)
            }
            ("printf", [Value::Str(fmt), v]) => {
                print!("{}", format_printf(fmt, v)?);
                Ok(Value::Null)
            }
            ("toString", []) => Ok(Value::Str(receiver.describe())),
            _ => bail!("no host method {method}/{}", args.len()),
        }
    }
}

// ─── Script-owner resolution ──────────────────────────────────

/// How the script owner handles a call that reached it.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnerCall {
    /// Invoke the named step with these arguments.
    Step { step: String, args: Vec<Value> },
    /// Load and run an auxiliary script.
    Load { name: String },
}

/// Resolve a call on the script owner. Printing names become `echo`,
/// `sleep` becomes the `sleep` step, `load` is built in, and every other
/// name is looked up as a step of the same name.
pub fn resolve_on_script(method: &str, args: Vec<Value>) -> Result<OwnerCall> {
    let echo = |message: String| OwnerCall::Step {
        step: "echo".to_string(),
        args: vec![Value::Str(message)],
    };

    let call = match (intercepts(method, args.len()), method) {
        (Some(InterceptedOp::PrintlnEmpty), _) => echo(String::new()),
        (Some(InterceptedOp::Println), _) | (Some(InterceptedOp::Print), _) => {
            echo(args[0].to_string())
        }
        (Some(InterceptedOp::Printf), _) => {
            let fmt = args[0]
                .as_str()
                .ok_or_else(|| anyhow!("printf: format must be a string"))?;
            echo(format_printf(fmt, &args[1])?)
        }
        (Some(InterceptedOp::Sleep), _) => OwnerCall::Step {
            step: "sleep".to_string(),
            args,
        },
        (None, "load") => {
            let name = match args.as_slice() {
                [Value::Str(name)] => name.clone(),
                _ => bail!("load: expected a single script name"),
            };
            OwnerCall::Load { name }
        }
        (None, _) => OwnerCall::Step {
            step: method.to_string(),
            args,
        },
    };
    Ok(call)
}

static PRINTF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%[%sd]").unwrap());

/// Minimal `printf` formatting: `%s`, `%d` and `%%`, single value.
pub fn format_printf(fmt: &str, value: &Value) -> Result<String> {
    let mut out = String::with_capacity(fmt.len());
    let mut last = 0;
    let mut used = false;
    for m in PRINTF_RE.find_iter(fmt) {
        out.push_str(&fmt[last..m.start()]);
        last = m.end();
        match m.as_str() {
            "%%" => out.push('%'),
            spec => {
                if used {
                    bail!("printf: more conversions than values in {fmt:?}");
                }
                used = true;
                if spec == "%d" && !matches!(value, Value::I64(_)) {
                    bail!("printf: %d expects an integer, got {value}");
                }
                out.push_str(&value.to_string());
            }
        }
    }
    out.push_str(&fmt[last..]);
    Ok(out)
}
