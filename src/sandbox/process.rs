use std::io;

use async_trait::async_trait;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use tokio::process::Command;

use super::{supervise, ProcessOutcome, ProcessSpec, Sandbox};
use crate::config::ResourceLimits;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs programs as local child processes.
///
/// Containment is limited to what an unprivileged process can impose on its
/// own children: rlimits, a private process group, a scrubbed environment and
/// a job-scoped working directory. It does not isolate the network or the
/// filesystem; use [`super::DockerSandbox`] where that matters.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    nproc_limit: bool,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also apply `process_limit` as RLIMIT_NPROC. The kernel counts every
    /// process of the real uid against it, not only the job's.
    pub fn with_nproc_limit(mut self, enabled: bool) -> Self {
        self.nproc_limit = enabled;
        self
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutcome> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", &spec.workdir)
            .env("LANG", "C.UTF-8");

        let limits = spec.limits.clone();
        let nproc_limit = self.nproc_limit;
        // SAFETY: runs in the forked child before exec. `apply_rlimits` only
        // issues setrlimit(2) calls, which are async-signal-safe, and does not
        // allocate.
        unsafe {
            command.pre_exec(move || apply_rlimits(&limits, nproc_limit));
        }

        tracing::debug!(
            job_id = %spec.job_id,
            stage = %spec.stage,
            command = ?spec.command,
            "Spawning sandboxed process"
        );
        supervise(command, spec).await
    }
}

fn apply_rlimits(limits: &ResourceLimits, nproc_limit: bool) -> io::Result<()> {
    lower(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(secs) = limits.cpu_time_secs {
        // Soft limit delivers SIGXCPU, the hard limit one second later SIGKILL.
        lower(Resource::RLIMIT_CPU, secs, secs + 1)?;
    }
    if let Some(bytes) = limits.memory_bytes {
        lower(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        lower(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if let Some(count) = limits.process_limit.filter(|_| nproc_limit) {
        lower(Resource::RLIMIT_NPROC, count, count)?;
    }
    Ok(())
}

/// Unprivileged processes may only lower a hard limit, never raise it.
fn lower(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}
