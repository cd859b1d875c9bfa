//! Worker execution engine for running jobs.
//!
//! This module turns queued job ids into terminal job records:
//! - **Execution**: materializes the source, compiles and runs it in a sandbox
//! - **Pool**: a fixed set of workers draining the execution queue
//!
//! # Components
//!
//! - [`JobExecutor`]: compiles and runs one job, returns an outcome
//! - [`WorkerPool`]: spawns and stops the worker tasks
//!
//! # Execution Flow
//!
//! 1. A worker takes the next id from the queue
//! 2. The job is marked `running` in the store
//! 3. [`JobExecutor::execute`] compiles (if needed) and runs the program
//! 4. The terminal outcome is written back to the store
//!
//! A fault while handling one job is recorded on that job as
//! `InternalError`; the worker keeps serving the queue.

pub mod executor;
pub mod pool;

pub use executor::JobExecutor;
pub use pool::WorkerPool;
