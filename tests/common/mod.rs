//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use pipeline_replay::config::{EngineConfig, ReplayConfig};
use pipeline_replay::dispatch::StandardAmbient;
use pipeline_replay::engine::{PipelineEngine, RunProgress};
use pipeline_replay::permissions::{MemoryPermissions, Permission, PermissionCatalog, Principal};
use pipeline_replay::replay::ReplayService;
use pipeline_replay::scheduler::{MemoryScheduler, QueueHandle, Scheduler};
use pipeline_replay::state::{StepCall, Value};
use pipeline_replay::steps::{StepCatalog, StepDescriptor, StepLibrary, StepResult};
use pipeline_replay::store::RunStore;
use pipeline_replay::store_memory::MemoryStore;
use pipeline_replay::types::{JobDefinition, Run, RunId};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Step library that records every executed step as `name(args)`.
pub struct RecordingSteps {
    catalog: StepCatalog,
    pub log: Mutex<Vec<String>>,
}

impl RecordingSteps {
    pub fn new() -> Self {
        Self {
            catalog: StepCatalog::basic(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepLibrary for RecordingSteps {
    fn descriptor(&self, name: &str) -> Option<StepDescriptor> {
        self.catalog.get(name).cloned()
    }

    async fn execute(&self, call: &StepCall) -> Result<StepResult> {
        let args: Vec<String> = call.args.iter().map(Value::to_string).collect();
        self.log
            .lock()
            .unwrap()
            .push(format!("{}({})", call.step, args.join(", ")));
        match call.step.as_str() {
            "node" | "stage" => Ok(StepResult::RunBody),
            _ => Ok(StepResult::Value(Value::Null)),
        }
    }
}

/// Everything wired together over one in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub steps: Arc<RecordingSteps>,
    pub engine: Arc<PipelineEngine>,
    pub scheduler: Arc<MemoryScheduler>,
    pub service: ReplayService,
}

pub fn developer() -> Principal {
    Principal::new("alice", vec!["dev".into()])
}

pub fn admin() -> Principal {
    Principal::new("root", vec!["admin".into()])
}

/// `dev` may replay; `admin` may also run unsandboxed scripts.
pub fn permissions() -> MemoryPermissions {
    MemoryPermissions::new(PermissionCatalog::standard().seal())
        .grant("dev", Permission::Replay)
        .grant("admin", Permission::Replay)
        .grant("admin", Permission::RunScripts)
}

pub fn engine_over(store: Arc<MemoryStore>, steps: Arc<RecordingSteps>) -> Arc<PipelineEngine> {
    Arc::new(PipelineEngine::new(
        store,
        steps,
        Arc::new(StandardAmbient),
        EngineConfig::default(),
    ))
}

impl Harness {
    pub async fn new(jobs: Vec<JobDefinition>) -> Self {
        Self::over(Arc::new(MemoryStore::new()), jobs).await
    }

    pub async fn over(store: Arc<MemoryStore>, jobs: Vec<JobDefinition>) -> Self {
        let steps = Arc::new(RecordingSteps::new());
        let engine = engine_over(store.clone(), steps.clone());
        let scheduler = Arc::new(MemoryScheduler::new(store.clone(), engine.clone()));
        for job in jobs {
            scheduler.register_job(job).await;
        }
        let service = ReplayService::new(
            store.clone(),
            engine.clone(),
            Arc::new(permissions()),
            scheduler.clone(),
            ReplayConfig::default(),
        );
        Self {
            store,
            steps,
            engine,
            scheduler,
            service,
        }
    }

    /// Submit a plain run of `job` and start it.
    pub async fn start_job(&self, job: &str) -> Run {
        let handle = self
            .scheduler
            .submit(job, Duration::ZERO, vec![])
            .await
            .unwrap()
            .unwrap();
        self.start(handle).await
    }

    /// Start a queued item and return the run it became.
    pub async fn start(&self, mut handle: QueueHandle) -> Run {
        self.scheduler.start_ready().await.unwrap();
        let id = handle.wait_for_start().await.unwrap();
        self.run(&id).await
    }

    pub async fn run(&self, id: &RunId) -> Run {
        self.store.load_run(id).await.unwrap().unwrap()
    }

    pub async fn drive(&self, run: &Run) -> RunProgress {
        self.engine.drive(&run.id).await.unwrap()
    }
}
