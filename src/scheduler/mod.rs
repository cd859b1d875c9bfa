pub mod job;
pub mod queue;
pub mod store;

pub use job::{ErrorKind, ExecutionOutcome, Job, JobStatus};
pub use queue::{ExecutionQueue, QueueReceiver};
pub use store::{InMemoryJobStore, JobStore};
