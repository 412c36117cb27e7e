use crate::pipeline::run::{PipelineRun, RunStage};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Everything a handler needs to reach a run without holding its lock: the
/// stage can be read and the run cancelled while the ingest worker owns it.
#[derive(Clone)]
pub struct RunHandle {
    pub id: Uuid,
    pub owner: String,
    pub run: Arc<Mutex<PipelineRun>>,
    pub stage: watch::Receiver<RunStage>,
    pub cancel: CancellationToken,
}

impl RunHandle {
    pub fn current_stage(&self) -> RunStage {
        *self.stage.borrow()
    }
}

struct Entry {
    handle: RunHandle,
    touched: Instant,
}

impl Entry {
    /// Finished runs go at once; selecting or reviewing runs after `idle`
    /// without a lookup. Runs the worker is driving are never evicted.
    fn is_evictable(&mut self, idle: Duration, now: Instant) -> bool {
        match self.handle.current_stage() {
            RunStage::Done => true,
            RunStage::Selecting | RunStage::Reviewing => {
                now.saturating_duration_since(self.touched) >= idle
            }
            _ => {
                self.touched = now;
                false
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: PipelineRun) -> RunHandle {
        let handle = RunHandle {
            id: run.id(),
            owner: run.owner().to_string(),
            stage: run.watch_stage(),
            cancel: run.root_cancel_token(),
            run: Arc::new(Mutex::new(run)),
        };
        let entry = Entry {
            handle: handle.clone(),
            touched: Instant::now(),
        };
        self.runs.lock().await.insert(handle.id, entry);
        handle
    }

    pub async fn get(&self, id: Uuid) -> Option<RunHandle> {
        let mut runs = self.runs.lock().await;
        let entry = runs.get_mut(&id)?;
        entry.touched = Instant::now();
        Some(entry.handle.clone())
    }

    /// Drops the run from the registry and cancels whatever it is doing.
    pub async fn remove(&self, id: Uuid) -> Option<RunHandle> {
        let entry = self.runs.lock().await.remove(&id)?;
        entry.handle.cancel.cancel();
        Some(entry.handle)
    }

    /// Removes finished and idle runs, cancelling each. Returns how many went.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut runs = self.runs.lock().await;
        let expired: Vec<Uuid> = runs
            .iter_mut()
            .filter_map(|(id, entry)| entry.is_evictable(idle, now).then_some(*id))
            .collect();
        for id in &expired {
            if let Some(entry) = runs.remove(id) {
                entry.handle.cancel.cancel();
            }
        }
        expired.len()
    }

    pub fn spawn_sweeper(&self, idle: Duration, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(idle).await;
                if evicted > 0 {
                    info!(target = "hermes.pipeline", evicted, "runs_evicted");
                }
            }
        })
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_cancels_the_run() {
        let registry = RunRegistry::new();
        let handle = registry.insert(PipelineRun::new("operator-1")).await;
        let ingestion = handle.run.lock().await.cancel_token();
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(handle.id).await.is_some());

        let removed = registry.remove(handle.id).await.expect("present");
        assert!(removed.cancel.is_cancelled());
        assert!(ingestion.is_cancelled());
        assert!(registry.get(handle.id).await.is_none());
    }

    #[tokio::test]
    async fn handle_sees_stage_without_the_lock() {
        let registry = RunRegistry::new();
        let handle = registry.insert(PipelineRun::new("operator-1")).await;
        let guard = handle.run.lock().await;
        drop(guard);
        handle.run.lock().await.set_stage(RunStage::Queued);
        assert_eq!(handle.current_stage(), RunStage::Queued);
    }

    #[tokio::test]
    async fn sweep_drops_finished_and_idle_runs_but_not_active_ones() {
        let registry = RunRegistry::new();
        let done = registry.insert(PipelineRun::new("operator-1")).await;
        let queued = registry.insert(PipelineRun::new("operator-1")).await;
        let selecting = registry.insert(PipelineRun::new("operator-1")).await;
        done.run.lock().await.set_stage(RunStage::Done);
        queued.run.lock().await.set_stage(RunStage::Queued);

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 1);
        assert!(done.cancel.is_cancelled());
        assert!(registry.get(done.id).await.is_none());
        assert!(registry.get(selecting.id).await.is_some());

        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert!(selecting.cancel.is_cancelled());
        assert!(!queued.cancel.is_cancelled());
        assert!(registry.get(queued.id).await.is_some());
        assert_eq!(registry.len().await, 1);
    }
}
