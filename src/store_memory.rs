//! In-memory stores.

use crate::events::ExecutionEvent;
use crate::state::ExecutionState;
use crate::store::{ExecutionStore, RunStore};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory RunStore + ExecutionStore for tests and the demo binary.
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, Run>>,
    run_numbers: RwLock<HashMap<String, RunNumber>>,
    executions: RwLock<HashMap<RunId, ExecutionState>>,
    events: RwLock<HashMap<RunId, Vec<ExecutionEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            run_numbers: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, id: &RunId) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.get(id).cloned())
    }

    async fn delete_run(&self, id: &RunId) -> Result<()> {
        self.runs.write().await.remove(id);
        self.executions.write().await.remove(id);
        Ok(())
    }

    async fn next_run_number(&self, job: &str) -> Result<RunNumber> {
        let mut numbers = self.run_numbers.write().await;
        let next = numbers.entry(job.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, state: &ExecutionState) -> Result<()> {
        let mut executions = self.executions.write().await;
        executions.insert(state.run.clone(), state.clone());
        Ok(())
    }

    async fn load_execution(&self, run: &RunId) -> Result<Option<ExecutionState>> {
        let executions = self.executions.read().await;
        Ok(executions.get(run).cloned())
    }

    async fn delete_execution(&self, run: &RunId) -> Result<()> {
        self.executions.write().await.remove(run);
        Ok(())
    }

    async fn append_event(&self, run: &RunId, event: &ExecutionEvent) -> Result<u64> {
        let mut events = self.events.write().await;
        let log = events.entry(run.clone()).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }

    async fn read_events(&self, run: &RunId, from_seq: u64) -> Result<Vec<(u64, ExecutionEvent)>> {
        let events = self.events.read().await;
        Ok(events
            .get(run)
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn run_numbers_increase_per_job() {
        let store = MemoryStore::new();
        assert_eq!(store.next_run_number("a").await.unwrap(), 1);
        assert_eq!(store.next_run_number("a").await.unwrap(), 2);
        assert_eq!(store.next_run_number("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deleted_run_loads_as_none() {
        let store = MemoryStore::new();
        let run = Run::new(RunId::new("a", 1), vec![]);
        store.save_run(&run).await.unwrap();
        store
            .save_execution(&ExecutionState::new(
                run.id.clone(),
                String::new(),
                BTreeMap::new(),
                true,
            ))
            .await
            .unwrap();
        store.delete_run(&run.id).await.unwrap();
        assert!(store.load_run(&run.id).await.unwrap().is_none());
        assert!(store.load_execution(&run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_sequenced_from_one() {
        let store = MemoryStore::new();
        let id = RunId::new("a", 1);
        store.append_event(&id, &ExecutionEvent::Completed).await.unwrap();
        let seq = store
            .append_event(&id, &ExecutionEvent::Failed { message: "x".into() })
            .await
            .unwrap();
        assert_eq!(seq, 2);
        let tail = store.read_events(&id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(matches!(tail[0].1, ExecutionEvent::Failed { .. }));
    }
}
