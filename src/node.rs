use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::scheduler::{queue, ExecutionQueue, InMemoryJobStore, JobStore, QueueReceiver};
use crate::service::{StatusReporter, SubmissionGate};
use crate::worker::{JobExecutor, WorkerPool};

/// Main node that orchestrates all components
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: ExecutionQueue,
    receiver: QueueReceiver,
    pub executor: JobExecutor,
}

impl Node {
    /// Build a node backed by the in-memory job store.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryJobStore::new()))
    }

    /// Build a node on top of an externally provided job store.
    pub fn with_store(config: NodeConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        config.validate()?;
        let (queue, receiver) = queue::channel(config.queue_capacity);
        let executor = JobExecutor::from_config(&config);
        Ok(Self {
            config,
            store,
            queue,
            receiver,
            executor,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            gate: SubmissionGate::new(
                self.store.clone(),
                self.queue.clone(),
                self.config.max_source_bytes,
            ),
            reporter: StatusReporter::new(self.store.clone()),
            workers: self.config.workers,
        }
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Prepares the workspace root
    /// 2. Spawns the worker pool on the execution queue
    /// 3. Serves the HTTP API (blocking)
    /// 4. Once the server stops, lets in-flight jobs finish and stops the pool
    ///
    /// # Errors
    ///
    /// Returns an error if the workspace root cannot be created or the HTTP
    /// server fails to bind. Job failures never surface here.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.workspace_dir).await?;
        tracing::info!(
            workspace = %self.config.workspace_dir.display(),
            queue_capacity = self.config.queue_capacity,
            max_source_bytes = self.config.max_source_bytes,
            "Node starting"
        );

        let state = self.api_state();
        let pool = WorkerPool::spawn(
            self.config.workers,
            self.receiver,
            self.store,
            self.executor,
            shutdown.clone(),
        );

        let served = api::serve(self.config.listen_addr, state, shutdown.clone()).await;
        if served.is_err() {
            shutdown.cancel();
        }
        pool.shutdown().await;
        served?;

        tracing::info!("Node stopped");
        Ok(())
    }
}
