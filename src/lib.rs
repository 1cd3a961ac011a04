//! Suspend-safe script dispatch and replay for pausable pipelines.
//!
//! Runs execute recorded script text on a tick-based VM whose whole state
//! is serializable. Calls made inside closures that would otherwise hit a
//! host default (`sleep`, `println`, ...) are forwarded to the closure's
//! owner as explicit suspension points, so they become pipeline steps.
//!
//! On top of that sits replay: read the scripts a run executed, launch an
//! edited copy as a new run linked by a replay cause, and diff any replay
//! against the root of its lineage.

pub mod compiler;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod form;
pub mod lineage;
pub mod permissions;
pub mod policy;
pub mod replay;
pub mod scheduler;
pub mod scripts;
pub mod state;
pub mod steps;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod vm;

pub use engine::{PipelineEngine, RunProgress};
pub use error::{ReplayError, ReplayResult};
pub use replay::{ReplayRequest, ReplayService, ReplaySubmission};
