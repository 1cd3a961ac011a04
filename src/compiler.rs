//! Script compiler
//!
//! Turns recorded script text into a flat instruction list. The accepted
//! syntax is intentionally small: one statement per line, where a statement
//! is either `def name = expr` or a call `name(args)` / `name args`. A call
//! line ending in `{` (optionally `{ a, b ->`) opens a closure that is passed
//! as the call's last argument; a line holding only `}` closes it.
//!
//! Compilation is deterministic, so a resumed run rebuilds exactly the
//! addresses its persisted frames point into.

use crate::types::Addr;
use anyhow::{anyhow, bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::LazyLock;

// ─── Instructions ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    PushNull,
    PushBool(bool),
    PushI64(i64),
    PushStr(String),
    Load { name: String },
    Store { name: String },
    Pop,
    /// Push a closure over `closures[closure]` owned by the current receiver.
    MakeClosure { closure: u32 },
    /// Call `method` with `argc` arguments taken from the stack.
    Invoke { method: String, argc: u16 },
    /// End of a closure body.
    Return,
    /// End of a script body.
    End,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosurePlan {
    pub entry: Addr,
    pub params: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub program: Vec<Instr>,
    pub closures: Vec<ClosurePlan>,
    /// Instruction address → 1-based source line.
    pub debug_map: BTreeMap<Addr, usize>,
}

impl CompiledProgram {
    pub fn line_of(&self, pc: Addr) -> Option<usize> {
        self.debug_map.get(&pc).copied()
    }
}

// ─── Syntax tree ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Null,
    Bool(bool),
    I64(i64),
    Str(String),
    Var(String),
}

#[derive(Clone, Debug)]
enum Stmt {
    Def {
        name: String,
        expr: Expr,
        line: usize,
    },
    Call {
        method: String,
        args: Vec<Expr>,
        block: Option<Block>,
        line: usize,
    },
}

#[derive(Clone, Debug, Default)]
struct Block {
    params: Vec<String>,
    body: Vec<Stmt>,
}

/// A call line whose closure is still open.
struct OpenCall {
    method: String,
    args: Vec<Expr>,
    line: usize,
    block: Block,
}

static DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^def\s+([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+)$").unwrap());

static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*(.*)$").unwrap());

/// Trailing `{` with optional `a, b ->` closure parameters.
static BLOCK_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\s*(?:([A-Za-z_][A-Za-z0-9_\s,]*)->)?\s*$").unwrap()
});

// ─── Public entry point ───────────────────────────────────────

/// Compile a script text.
pub fn compile(text: &str) -> Result<CompiledProgram> {
    let body = parse(text)?;
    Ok(codegen(body))
}

// ─── Parsing ──────────────────────────────────────────────────

fn parse(text: &str) -> Result<Vec<Stmt>> {
    let mut root: Vec<Stmt> = Vec::new();
    let mut open: Vec<OpenCall> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        if line == "}" {
            let call = open
                .pop()
                .ok_or_else(|| anyhow!("line {line_no}: unmatched '}}'"))?;
            let stmt = Stmt::Call {
                method: call.method,
                args: call.args,
                block: Some(call.block),
                line: call.line,
            };
            push_stmt(&mut root, &mut open, stmt);
            continue;
        }

        if let Some(caps) = DEF_RE.captures(line) {
            let expr = parse_single_expr(&caps[2], line_no)?;
            let stmt = Stmt::Def {
                name: caps[1].to_string(),
                expr,
                line: line_no,
            };
            push_stmt(&mut root, &mut open, stmt);
            continue;
        }

        let caps = CALL_RE
            .captures(line)
            .ok_or_else(|| anyhow!("line {line_no}: expected a call or definition"))?;
        let method = caps[1].to_string();
        let mut rest = caps[2].trim().to_string();

        let block_open = BLOCK_OPEN_RE.captures(&rest).and_then(|caps| {
            let start = caps.get(0)?.start();
            if inside_string(&rest, start) {
                return None;
            }
            let params: Vec<String> = caps
                .get(1)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Some((start, params))
        });

        let mut params = None;
        if let Some((cut, block_params)) = block_open {
            rest.truncate(cut);
            rest = rest.trim().to_string();
            params = Some(block_params);
        }

        let args = if rest.starts_with('(') {
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| anyhow!("line {line_no}: unbalanced parentheses"))?;
            parse_args(inner, line_no)?
        } else {
            parse_args(&rest, line_no)?
        };

        match params {
            Some(params) => open.push(OpenCall {
                method,
                args,
                line: line_no,
                block: Block {
                    params,
                    body: Vec::new(),
                },
            }),
            None => push_stmt(
                &mut root,
                &mut open,
                Stmt::Call {
                    method,
                    args,
                    block: None,
                    line: line_no,
                },
            ),
        }
    }

    if let Some(unclosed) = open.last() {
        bail!(
            "line {}: closure opened by '{}' is never closed",
            unclosed.line,
            unclosed.method
        );
    }
    Ok(root)
}

fn push_stmt(root: &mut Vec<Stmt>, open: &mut [OpenCall], stmt: Stmt) {
    match open.last_mut() {
        Some(call) => call.block.body.push(stmt),
        None => root.push(stmt),
    }
}

/// True when byte offset `at` falls inside a quoted string of `s`.
fn inside_string(s: &str, at: usize) -> bool {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        if i >= at {
            break;
        }
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if ch == '\\' => escaped = true,
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None => {}
        }
    }
    quote.is_some()
}

fn parse_single_expr(src: &str, line_no: usize) -> Result<Expr> {
    let mut args = parse_args(src, line_no)?;
    if args.len() != 1 {
        bail!("line {line_no}: expected exactly one expression");
    }
    Ok(args.remove(0))
}

fn parse_args(src: &str, line_no: usize) -> Result<Vec<Expr>> {
    let chars: Vec<char> = src.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;

    let skip_ws = |i: &mut usize| {
        while *i < chars.len() && chars[*i].is_whitespace() {
            *i += 1;
        }
    };

    skip_ws(&mut i);
    if i == chars.len() {
        return Ok(args);
    }

    loop {
        skip_ws(&mut i);
        let ch = chars
            .get(i)
            .copied()
            .ok_or_else(|| anyhow!("line {line_no}: expected an argument"))?;

        let expr = if ch == '\'' || ch == '"' {
            let quote = ch;
            i += 1;
            let mut out = String::new();
            loop {
                let c = chars
                    .get(i)
                    .copied()
                    .ok_or_else(|| anyhow!("line {line_no}: unterminated string literal"))?;
                i += 1;
                if c == quote {
                    break;
                }
                if c == '\\' {
                    let esc = chars
                        .get(i)
                        .copied()
                        .ok_or_else(|| anyhow!("line {line_no}: dangling escape"))?;
                    i += 1;
                    out.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    out.push(c);
                }
            }
            Expr::Str(out)
        } else {
            let start = i;
            while i < chars.len() && chars[i] != ',' && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            parse_word(&word, line_no)?
        };
        args.push(expr);

        skip_ws(&mut i);
        match chars.get(i) {
            None => break,
            Some(',') => i += 1,
            Some(other) => bail!("line {line_no}: unexpected '{other}' in arguments"),
        }
    }
    Ok(args)
}

fn parse_word(word: &str, line_no: usize) -> Result<Expr> {
    match word {
        "null" => return Ok(Expr::Null),
        "true" => return Ok(Expr::Bool(true)),
        "false" => return Ok(Expr::Bool(false)),
        _ => {}
    }
    if let Ok(n) = word.parse::<i64>() {
        return Ok(Expr::I64(n));
    }
    let is_ident = word
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if is_ident {
        Ok(Expr::Var(word.to_string()))
    } else {
        Err(anyhow!("line {line_no}: cannot parse '{word}'"))
    }
}

// ─── Code generation ──────────────────────────────────────────

struct Codegen {
    out: CompiledProgram,
    queue: VecDeque<(u32, Block)>,
}

fn codegen(body: Vec<Stmt>) -> CompiledProgram {
    let mut cg = Codegen {
        out: CompiledProgram::default(),
        queue: VecDeque::new(),
    };
    cg.emit_body(&body);
    cg.push(Instr::End, None);

    while let Some((idx, block)) = cg.queue.pop_front() {
        let entry = cg.out.program.len() as Addr;
        cg.out.closures[idx as usize].entry = entry;
        cg.emit_body(&block.body);
        cg.push(Instr::Return, None);
    }
    cg.out
}

impl Codegen {
    fn push(&mut self, instr: Instr, line: Option<usize>) {
        let addr = self.out.program.len() as Addr;
        if let Some(line) = line {
            self.out.debug_map.insert(addr, line);
        }
        self.out.program.push(instr);
    }

    fn emit_expr(&mut self, expr: &Expr, line: usize) {
        let instr = match expr {
            Expr::Null => Instr::PushNull,
            Expr::Bool(b) => Instr::PushBool(*b),
            Expr::I64(n) => Instr::PushI64(*n),
            Expr::Str(s) => Instr::PushStr(s.clone()),
            Expr::Var(name) => Instr::Load { name: name.clone() },
        };
        self.push(instr, Some(line));
    }

    fn emit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            match stmt {
                Stmt::Def { name, expr, line } => {
                    self.emit_expr(expr, *line);
                    self.push(Instr::Store { name: name.clone() }, Some(*line));
                }
                Stmt::Call {
                    method,
                    args,
                    block,
                    line,
                } => {
                    for arg in args {
                        self.emit_expr(arg, *line);
                    }
                    let mut argc = args.len();
                    if let Some(block) = block {
                        let idx = self.out.closures.len() as u32;
                        self.out.closures.push(ClosurePlan {
                            entry: 0,
                            params: block.params.clone(),
                        });
                        self.queue.push_back((idx, block.clone()));
                        self.push(Instr::MakeClosure { closure: idx }, Some(*line));
                        argc += 1;
                    }
                    self.push(
                        Instr::Invoke {
                            method: method.clone(),
                            argc: argc as u16,
                        },
                        Some(*line),
                    );
                    self.push(Instr::Pop, Some(*line));
                }
            }
        }
    }
}
