use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoderunError, Result};
use crate::scheduler::job::{ExecutionOutcome, Job};

/// Record keeper for submitted jobs.
///
/// Implementations must serialize updates to a single record. Exclusive
/// ownership of a running job comes from the execution queue, so the store
/// only has to reject illegal state transitions, not arbitrate between
/// workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created pending job.
    async fn create(&self, job: Job) -> Result<()>;

    async fn get(&self, id: &Uuid) -> Result<Option<Job>>;

    /// All jobs, oldest submission first.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Move a pending job to `running` and return the updated snapshot.
    async fn mark_running(&self, id: &Uuid, worker_id: usize) -> Result<Job>;

    /// Record the terminal outcome of a running job.
    async fn complete(&self, id: &Uuid, outcome: ExecutionOutcome) -> Result<Job>;
}

/// Process-local store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(CoderunError::Internal(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        Ok(jobs)
    }

    async fn mark_running(&self, id: &Uuid, worker_id: usize) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(CoderunError::JobNotFound(*id))?;
        job.start(worker_id, Utc::now())?;
        Ok(job.clone())
    }

    async fn complete(&self, id: &Uuid, outcome: ExecutionOutcome) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or(CoderunError::JobNotFound(*id))?;
        job.finish(outcome, Utc::now())?;
        Ok(job.clone())
    }
}
