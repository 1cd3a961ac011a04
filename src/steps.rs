//! Step-library contract.
//!
//! The library itself (what `echo` or `sleep` actually do) lives outside
//! this crate; the engine only needs descriptors to decide whether a name is
//! a step, and an executor to drive parked calls.

use crate::state::{StepCall, Value};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    /// The step accepts a closure body as its last argument.
    pub takes_body: bool,
}

/// How a parked step finished.
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    /// The step returned a value to the calling script.
    Value(Value),
    /// Run the step's body now; its return value becomes the step's value.
    RunBody,
    /// The step failed; the run fails with this message.
    Failed(String),
}

#[async_trait]
pub trait StepLibrary: Send + Sync {
    fn descriptor(&self, name: &str) -> Option<StepDescriptor>;

    /// Perform a parked step. Called by `PipelineEngine::drive`.
    async fn execute(&self, call: &StepCall) -> Result<StepResult>;
}

/// Descriptor table with no execution behaviour of its own.
#[derive(Clone, Debug, Default)]
pub struct StepCatalog {
    steps: BTreeMap<String, StepDescriptor>,
}

impl StepCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `sleep`, and the block steps `node` and `stage`.
    pub fn basic() -> Self {
        Self::new()
            .with_step("echo")
            .with_step("sleep")
            .with_block_step("node")
            .with_block_step("stage")
    }

    pub fn with_step(mut self, name: &str) -> Self {
        self.steps.insert(
            name.to_string(),
            StepDescriptor {
                name: name.to_string(),
                takes_body: false,
            },
        );
        self
    }

    pub fn with_block_step(mut self, name: &str) -> Self {
        self.steps.insert(
            name.to_string(),
            StepDescriptor {
                name: name.to_string(),
                takes_body: true,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }
}
