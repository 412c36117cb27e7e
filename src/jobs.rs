use crate::{
    config::env_usize,
    pipeline::{
        Pipeline, PipelineError,
        run::{IngestOptions, PipelineRun, RunStage},
    },
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Single background worker; ingestions run one at a time in arrival order.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

struct IngestJob {
    run_id: Uuid,
    run: Arc<Mutex<PipelineRun>>,
    options: IngestOptions,
}

impl IngestQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<IngestJob>(env_usize("QUEUE_CAPACITY", 64));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let mut run = job.run.lock().await;
                if run.root_cancel_token().is_cancelled() {
                    info!(target = "hermes.pipeline", run_id = %job.run_id, "ingest_skipped_cancelled_run");
                    continue;
                }
                if let Err(err) = pipeline.ingest(&mut run, &job.options).await {
                    warn!(
                        target = "hermes.pipeline",
                        run_id = %job.run_id,
                        stage = err.stage(),
                        kind = ?err.kind(),
                        "ingest_job_failed"
                    );
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Marks the run queued and hands it to the worker. The caller must hold
    /// the run's lock so the stage check and the transition are atomic.
    pub fn enqueue(
        &self,
        run_lock: &Arc<Mutex<PipelineRun>>,
        run: &mut PipelineRun,
        options: IngestOptions,
    ) -> Result<(), PipelineError> {
        if run.stage() != RunStage::Selecting {
            return Err(PipelineError::conflict(
                "enqueue",
                format!("run is {:?}, expected selecting", run.stage()),
            ));
        }
        if run.photos().is_empty() {
            return Err(PipelineError::invalid_input("enqueue", "no photos selected"));
        }
        let job = IngestJob {
            run_id: run.id(),
            run: run_lock.clone(),
            options,
        };
        self.tx
            .try_send(job)
            .map_err(|err| PipelineError::internal("enqueue", format!("ingest queue: {err}")))?;
        run.set_stage(RunStage::Queued);
        Ok(())
    }
}
