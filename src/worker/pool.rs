use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{ExecutionOutcome, Job, JobStore, QueueReceiver};
use crate::worker::JobExecutor;

/// Fixed set of workers draining the execution queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` long-lived worker tasks.
    ///
    /// Workers exit when `shutdown` is cancelled (after finishing the job in
    /// hand) or when every queue producer is gone and the queue is drained.
    pub fn spawn(
        workers: usize,
        receiver: QueueReceiver,
        store: Arc<dyn JobStore>,
        executor: JobExecutor,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let store = store.clone();
                let executor = executor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, receiver, store, executor, shutdown).await;
                })
            })
            .collect();

        tracing::info!(workers, sandbox = executor.sandbox_name(), "Worker pool started");
        Self { handles, shutdown }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting queued jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// One worker: take an id, run it, record the result, repeat.
///
/// Each worker is the only writer of the jobs it dequeues, from `running`
/// until the terminal update.
async fn worker_loop(
    worker_id: usize,
    receiver: QueueReceiver,
    store: Arc<dyn JobStore>,
    executor: JobExecutor,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");
    loop {
        let job_id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        process_job(worker_id, job_id, store.as_ref(), &executor).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn process_job(worker_id: usize, job_id: Uuid, store: &dyn JobStore, executor: &JobExecutor) {
    let job = match store.mark_running(&job_id, worker_id).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(
                job_id = %job_id,
                worker_id,
                error = %e,
                "Cannot start job, it stays pending"
            );
            return;
        }
    };
    tracing::info!(job_id = %job_id, worker_id, language = %job.language, "Job started");

    let outcome = run_isolated(job, executor.clone()).await;

    match record(worker_id, job_id, store, outcome).await {
        Ok(job) => tracing::info!(
            job_id = %job_id,
            worker_id,
            status = %job.status,
            error_kind = ?job.error_kind,
            "Job completed"
        ),
        Err(e) => tracing::error!(
            job_id = %job_id,
            worker_id,
            error = %e,
            "Failed to record job result, it stays running"
        ),
    }
}

/// Write the terminal outcome. If the store rejects it, retry once with an
/// `InternalError` outcome so the job still reaches a terminal state.
async fn record(
    worker_id: usize,
    job_id: Uuid,
    store: &dyn JobStore,
    outcome: ExecutionOutcome,
) -> Result<Job> {
    match store.complete(&job_id, outcome).await {
        Ok(job) => Ok(job),
        Err(e) => {
            tracing::warn!(
                job_id = %job_id,
                worker_id,
                error = %e,
                "Failed to record job result, retrying as internal error"
            );
            let fallback = ExecutionOutcome::internal(format!("Failed to record result: {}", e));
            store.complete(&job_id, fallback).await
        }
    }
}

/// Run the executor on its own task so that a panic while handling one job
/// is recorded on that job instead of taking the worker down.
async fn run_isolated(job: Job, executor: JobExecutor) -> ExecutionOutcome {
    let Job {
        id,
        language,
        source,
        ..
    } = job;
    let task = tokio::spawn(async move { executor.execute(id, language, &source).await });

    match task.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!(job_id = %id, error = %e, "Executor fault");
            ExecutionOutcome::internal(format!("Execution failed: {}", e))
        }
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Execution task panicked");
            ExecutionOutcome::internal("Execution aborted by an internal fault")
        }
    }
}
