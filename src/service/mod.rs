//! Client-facing operations: submitting jobs and polling their status.

pub mod gate;
pub mod status;

pub use gate::SubmissionGate;
pub use status::StatusReporter;
