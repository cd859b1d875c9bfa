use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CoderunError, Result};
use crate::scheduler::{ExecutionQueue, Job, JobStore};
use crate::toolchain::Language;

/// Admission point for new code-execution requests.
///
/// Validates the request, records a pending job and enqueues it. Never waits
/// for execution: the caller gets the job id back as soon as it is queued.
#[derive(Clone)]
pub struct SubmissionGate {
    store: Arc<dyn JobStore>,
    queue: ExecutionQueue,
    max_source_bytes: usize,
}

impl SubmissionGate {
    pub fn new(store: Arc<dyn JobStore>, queue: ExecutionQueue, max_source_bytes: usize) -> Self {
        Self {
            store,
            queue,
            max_source_bytes,
        }
    }

    pub fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// Check a request without side effects.
    pub fn validate(&self, language: &str, source: Option<&str>) -> Result<Language> {
        let language: Language = language.parse()?;
        let source = source.unwrap_or_default();
        if source.trim().is_empty() {
            return Err(CoderunError::EmptySource);
        }
        if source.len() > self.max_source_bytes {
            return Err(CoderunError::SourceTooLarge {
                size: source.len(),
                limit: self.max_source_bytes,
            });
        }
        Ok(language)
    }

    /// Validate, record and enqueue a request, returning the new job id.
    ///
    /// A queue slot is reserved before the job record is created, so a full
    /// queue rejects the request without leaving an orphaned pending job.
    pub async fn submit(&self, language: &str, source: Option<&str>) -> Result<Uuid> {
        let validated = self.validate(language, source);
        let language = match validated {
            Ok(language) => language,
            Err(e) => {
                tracing::debug!(language, error = %e, "Submission rejected");
                return Err(e);
            }
        };

        let slot = match self.queue.try_reserve() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(
                    language = %language,
                    error = %e,
                    depth = self.queue.depth(),
                    "Submission rejected by queue"
                );
                return Err(e);
            }
        };

        let job = Job::new(language, source.unwrap_or_default().to_string());
        let job_id = job.id;
        self.store.create(job).await?;
        slot.send(job_id);

        tracing::info!(job_id = %job_id, language = %language, "Job submitted");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{queue, InMemoryJobStore, JobStatus};

    fn gate(capacity: usize) -> (SubmissionGate, Arc<InMemoryJobStore>, queue::QueueReceiver) {
        let store = Arc::new(InMemoryJobStore::new());
        let (queue, rx) = queue::channel(capacity);
        (SubmissionGate::new(store.clone(), queue, 32), store, rx)
    }

    #[tokio::test]
    async fn accepted_job_is_pending_and_queued() {
        let (gate, store, rx) = gate(4);
        let id = gate.submit("py", Some("print(1)")).await.unwrap();

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.language, Language::Python);
        assert_eq!(job.source, "print(1)");
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn validation_failures_create_nothing() {
        let (gate, store, _rx) = gate(4);

        assert!(matches!(
            gate.submit("java", Some("class A {}")).await,
            Err(CoderunError::UnsupportedLanguage(_))
        ));
        assert!(matches!(
            gate.submit("cpp", None).await,
            Err(CoderunError::EmptySource)
        ));
        assert!(matches!(
            gate.submit("cpp", Some("  \n\t")).await,
            Err(CoderunError::EmptySource)
        ));
        let oversized = "x".repeat(33);
        assert!(matches!(
            gate.submit("cpp", Some(oversized.as_str())).await,
            Err(CoderunError::SourceTooLarge { size: 33, limit: 32 })
        ));

        assert!(store.is_empty().await);
        assert_eq!(gate.queue().depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_leaves_no_orphan() {
        let (gate, store, _rx) = gate(1);
        gate.submit("cpp", Some("int main(){}")).await.unwrap();

        let err = gate.submit("cpp", Some("int main(){}")).await.unwrap_err();
        assert!(matches!(err, CoderunError::QueueFull));
        assert_eq!(store.len().await, 1);
    }
}
