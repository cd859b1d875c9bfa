use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoderunError, Result};
use crate::scheduler::{Job, JobStore};

/// Read-only view of job records for polling clients.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn JobStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Current snapshot of a job. Clients tell in-progress from finished jobs
    /// by `status` alone.
    pub async fn status(&self, id: &Uuid) -> Result<Job> {
        self.store
            .get(id)
            .await?
            .ok_or(CoderunError::JobNotFound(*id))
    }

    /// Every known job, oldest first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }
}
