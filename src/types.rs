use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Scalar aliases ───────────────────────────────────────────

/// Instruction address within one compiled script.
pub type Addr = u32;

/// Creation-order sequence number of a run within its job.
pub type RunNumber = u64;

// ─── Run identity ─────────────────────────────────────────────

/// Stable identifier of a run: owning job plus its sequence number.
///
/// Numbers increase monotonically per job, so a replay always points at a
/// strictly smaller number than its own.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub job: String,
    pub number: RunNumber,
}

impl RunId {
    pub fn new(job: impl Into<String>, number: RunNumber) -> Self {
        Self {
            job: job.into(),
            number,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

// ─── Causes ───────────────────────────────────────────────────

/// Why a run was scheduled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Cause {
    /// Started by a user (or by the system when `user_id` is `None`).
    UserId { user_id: Option<String> },
    /// Replay of an earlier run. Forms the backward lineage chain.
    Replay { original: RunId },
    /// Anything else (timer, upstream trigger, ...).
    Other { description: String },
}

// ─── Run actions ──────────────────────────────────────────────

/// Discriminant of [`RunAction`], used for the replay copy allow-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunActionKind {
    Parameters,
    ScmRevision,
    Causes,
    ReplayFlowFactory,
    Other,
}

/// Metadata attached to a run when it is scheduled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunAction {
    /// Build parameters.
    Parameters { values: BTreeMap<String, String> },
    /// Source revision the run was built from.
    ScmRevision { scm: String, revision: String },
    /// Causation records.
    Causes { causes: Vec<Cause> },
    /// Tells the engine to run these scripts instead of the job definition.
    ReplayFlowFactory {
        main_script: String,
        loaded_scripts: BTreeMap<String, String>,
        sandbox: bool,
    },
    /// Opaque metadata owned by other subsystems. Never copied by replay.
    Other {
        kind: String,
        payload: serde_json::Value,
    },
}

impl RunAction {
    pub fn kind(&self) -> RunActionKind {
        match self {
            RunAction::Parameters { .. } => RunActionKind::Parameters,
            RunAction::ScmRevision { .. } => RunActionKind::ScmRevision,
            RunAction::Causes { .. } => RunActionKind::Causes,
            RunAction::ReplayFlowFactory { .. } => RunActionKind::ReplayFlowFactory,
            RunAction::Other { .. } => RunActionKind::Other,
        }
    }
}

// ─── Run ──────────────────────────────────────────────────────

/// An executed (or executing) instance of a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub actions: Vec<RunAction>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: RunId, actions: Vec<RunAction>) -> Self {
        Self {
            id,
            actions,
            created_at: Utc::now(),
        }
    }

    /// All causes across every `Causes` action, in attachment order.
    pub fn causes(&self) -> impl Iterator<Item = &Cause> {
        self.actions.iter().flat_map(|a| match a {
            RunAction::Causes { causes } => causes.as_slice(),
            _ => &[][..],
        })
    }

    /// The run this one replays, if any.
    pub fn replay_of(&self) -> Option<&RunId> {
        self.causes().find_map(|c| match c {
            Cause::Replay { original } => Some(original),
            _ => None,
        })
    }

    pub fn actions_of(&self, kind: RunActionKind) -> impl Iterator<Item = &RunAction> {
        self.actions.iter().filter(move |a| a.kind() == kind)
    }
}

// ─── Job definition ───────────────────────────────────────────

/// What a job runs when it is not being replayed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub main_script: String,
    /// Scripts the main script may `load`, keyed by name.
    #[serde(default)]
    pub library: BTreeMap<String, String>,
    pub sandbox: bool,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, main_script: impl Into<String>, sandbox: bool) -> Self {
        Self {
            name: name.into(),
            main_script: main_script.into(),
            library: BTreeMap::new(),
            sandbox,
        }
    }

    pub fn with_library_script(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.library.insert(name.into(), text.into());
        self
    }
}
