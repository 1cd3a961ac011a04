//! Run scheduling.
//!
//! The replay launcher only needs "submit a job with these actions after a
//! quiet period"; [`MemoryScheduler`] is the in-process queue that turns
//! submissions into runs.

use crate::engine::PipelineEngine;
use crate::store::RunStore;
use crate::types::{JobDefinition, Run, RunAction, RunId};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Queue a new run of `job`. `Ok(None)` means the job refused the
    /// submission (unknown or not buildable).
    async fn submit(
        &self,
        job: &str,
        quiet_period: Duration,
        actions: Vec<RunAction>,
    ) -> Result<Option<QueueHandle>>;
}

/// Handle on a queued submission.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    pub item_id: u64,
    pub job: String,
    started: watch::Receiver<Option<RunId>>,
}

impl QueueHandle {
    /// The run started for this item, if it has started yet.
    pub fn started(&self) -> Option<RunId> {
        self.started.borrow().clone()
    }

    /// Wait until the item has become a run.
    pub async fn wait_for_start(&mut self) -> Result<RunId> {
        let started = self
            .started
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("queue item {} was dropped before starting", self.item_id))?;
        started
            .clone()
            .ok_or_else(|| anyhow!("queue item {} has no run", self.item_id))
    }
}

struct QueueItem {
    item_id: u64,
    job: String,
    actions: Vec<RunAction>,
    not_before: Instant,
    notify: watch::Sender<Option<RunId>>,
}

// ─── MemoryScheduler ──────────────────────────────────────────

pub struct MemoryScheduler {
    runs: Arc<dyn RunStore>,
    engine: Arc<PipelineEngine>,
    jobs: RwLock<HashMap<String, JobDefinition>>,
    queue: Mutex<VecDeque<QueueItem>>,
    next_item: AtomicU64,
}

impl MemoryScheduler {
    pub fn new(runs: Arc<dyn RunStore>, engine: Arc<PipelineEngine>) -> Self {
        Self {
            runs,
            engine,
            jobs: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            next_item: AtomicU64::new(1),
        }
    }

    pub async fn register_job(&self, job: JobDefinition) {
        self.jobs.write().await.insert(job.name.clone(), job);
    }

    pub async fn job(&self, name: &str) -> Option<JobDefinition> {
        self.jobs.read().await.get(name).cloned()
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Start the oldest item whose quiet period has elapsed.
    pub async fn start_next(&self) -> Result<Option<RunId>> {
        let item = {
            let mut queue = self.queue.lock().await;
            let now = Instant::now();
            match queue.iter().position(|item| item.not_before <= now) {
                Some(idx) => queue.remove(idx),
                None => None,
            }
        };
        let Some(item) = item else {
            return Ok(None);
        };

        let job = self
            .job(&item.job)
            .await
            .ok_or_else(|| anyhow!("job '{}' is no longer registered", item.job))?;
        let number = self.runs.next_run_number(&job.name).await?;
        let run = Run::new(RunId::new(job.name.clone(), number), item.actions);
        self.runs.save_run(&run).await?;
        info!(run = %run.id, item = item.item_id, "queue item started");

        self.engine.start(&run, &job).await?;
        // receivers may all be gone; the run is started regardless
        let _ = item.notify.send(Some(run.id.clone()));
        Ok(Some(run.id))
    }

    /// Start every item that is ready now.
    pub async fn start_ready(&self) -> Result<Vec<RunId>> {
        let mut started = Vec::new();
        while let Some(id) = self.start_next().await? {
            started.push(id);
        }
        Ok(started)
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn submit(
        &self,
        job: &str,
        quiet_period: Duration,
        actions: Vec<RunAction>,
    ) -> Result<Option<QueueHandle>> {
        if self.job(job).await.is_none() {
            debug!(%job, "submission refused: unknown job");
            return Ok(None);
        }
        let item_id = self.next_item.fetch_add(1, Ordering::SeqCst);
        let (notify, started) = watch::channel(None);
        self.queue.lock().await.push_back(QueueItem {
            item_id,
            job: job.to_string(),
            actions,
            not_before: Instant::now() + quiet_period,
            notify,
        });
        debug!(%job, item_id, ?quiet_period, "queued");
        Ok(Some(QueueHandle {
            item_id,
            job: job.to_string(),
            started,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dispatch::StandardAmbient;
    use crate::state::{StepCall, Value};
    use crate::steps::{StepCatalog, StepDescriptor, StepLibrary, StepResult};
    use crate::store_memory::MemoryStore;

    struct NoopSteps;

    #[async_trait]
    impl StepLibrary for NoopSteps {
        fn descriptor(&self, name: &str) -> Option<StepDescriptor> {
            StepCatalog::basic().get(name).cloned()
        }

        async fn execute(&self, _call: &StepCall) -> Result<StepResult> {
            Ok(StepResult::Value(Value::Null))
        }
    }

    async fn scheduler() -> (Arc<MemoryStore>, MemoryScheduler) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(PipelineEngine::new(
            store.clone(),
            Arc::new(NoopSteps),
            Arc::new(StandardAmbient),
            EngineConfig::default(),
        ));
        let scheduler = MemoryScheduler::new(store.clone(), engine);
        scheduler
            .register_job(JobDefinition::new("app", "echo 'hi'", true))
            .await;
        (store, scheduler)
    }

    #[tokio::test]
    async fn test_unknown_job_is_refused() {
        let (_, scheduler) = scheduler().await;
        let handle = scheduler
            .submit("nope", Duration::ZERO, vec![])
            .await
            .unwrap();
        assert!(handle.is_none());
        assert_eq!(scheduler.queued().await, 0);
    }

    #[tokio::test]
    async fn test_start_next_allocates_number_and_notifies() {
        let (store, scheduler) = scheduler().await;
        let mut handle = scheduler
            .submit("app", Duration::ZERO, vec![])
            .await
            .unwrap()
            .unwrap();
        assert!(handle.started().is_none());

        let id = scheduler.start_next().await.unwrap().unwrap();
        assert_eq!(id, RunId::new("app", 1));
        assert_eq!(handle.wait_for_start().await.unwrap(), id);
        assert!(store.load_run(&id).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_delays_start() {
        let (_, scheduler) = scheduler().await;
        scheduler
            .submit("app", Duration::from_secs(5), vec![])
            .await
            .unwrap()
            .unwrap();
        assert!(scheduler.start_next().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(scheduler.start_ready().await.unwrap().len(), 1);
    }
}
