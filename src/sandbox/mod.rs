//! Containment for untrusted programs.
//!
//! The executor never spawns processes itself. It describes one compile or
//! run step as a [`ProcessSpec`] and hands it to a [`Sandbox`], which decides
//! how the process is contained:
//!
//! - [`ProcessSandbox`]: local child in its own process group, rlimits
//!   applied before exec, scrubbed environment.
//! - [`DockerSandbox`]: `docker run` with networking disabled, all
//!   capabilities dropped and a read-only root filesystem.
//!
//! Both backends share [`supervise`], which enforces the wall-clock limit by
//! killing the whole process group and caps how much output is retained.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ResourceLimits;
use crate::toolchain::Language;

pub mod docker;
pub mod process;

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Run => write!(f, "run"),
        }
    }
}

/// One process to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub job_id: Uuid,
    pub stage: Stage,
    pub language: Language,
    /// Program followed by its arguments, relative to `workdir`.
    pub command: Vec<String>,
    /// Job workspace; the process runs with this as its working directory.
    pub workdir: PathBuf,
    pub limits: ResourceLimits,
}

/// What happened to a sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process did not exit normally.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// A stream produced more than `max_output_bytes`; the excess was dropped.
    pub output_truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The process was stopped by one of its resource limits rather than by
    /// its own logic or the wall clock.
    pub fn hit_resource_limit(&self) -> bool {
        if self.output_truncated {
            return true;
        }
        match self.signal {
            Some(sig) if sig == Signal::SIGXCPU as i32 || sig == Signal::SIGXFSZ as i32 => true,
            Some(sig) if sig == Signal::SIGKILL as i32 => !self.timed_out,
            _ => false,
        }
    }
}

/// Containment capability between the executor and the host.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Run `spec` to completion or until its limits stop it. `Err` means the
    /// process could not be started or supervised, not that it failed.
    async fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutcome>;
}

/// How long pipes may stay open after the process exits before the readers
/// are abandoned, when the wall-clock deadline has already passed.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Spawn `command` for `spec` and wait for it under the wall-clock limit.
///
/// The child leads a fresh process group so that a timeout, or the end of the
/// run, takes down anything it forked. A descendant that leaves the group
/// (`setsid`) and keeps a pipe open cannot hold the caller past the deadline:
/// the readers are abandoned, the run counts as timed out, and whatever was
/// captured so far is returned.
pub(crate) async fn supervise(mut command: Command, spec: &ProcessSpec) -> io::Result<ProcessOutcome> {
    command
        .current_dir(&spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + spec.limits.wall_time;
    let mut child = command.spawn()?;
    let pid = child.id();

    let limit = spec.limits.max_output_bytes;
    let stdout = SharedCapture::default();
    let stderr = SharedCapture::default();
    let mut stdout_task = tokio::spawn(read_capped(child.stdout.take(), limit, stdout.clone()));
    let mut stderr_task = tokio::spawn(read_capped(child.stderr.take(), limit, stderr.clone()));

    let (status, mut timed_out) = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => (status?, false),
        Err(_) => {
            tracing::warn!(
                job_id = %spec.job_id,
                stage = %spec.stage,
                limit_ms = spec.limits.wall_time.as_millis() as u64,
                "Wall-clock limit exceeded, killing process group"
            );
            if let Err(e) = kill_process_group(pid) {
                tracing::warn!(job_id = %spec.job_id, error = %e, "killpg failed, killing child only");
                child.start_kill()?;
            }
            (child.wait().await?, true)
        }
    };

    // Stragglers left in the group would keep the pipes open.
    let _ = kill_process_group(pid);

    let drain_deadline = deadline.max(tokio::time::Instant::now() + DRAIN_GRACE);
    let drained = tokio::time::timeout_at(drain_deadline, async {
        let out = (&mut stdout_task).await;
        let err = (&mut stderr_task).await;
        (out, err)
    })
    .await;
    match drained {
        Ok((out, err)) => {
            out.map_err(io::Error::other)??;
            err.map_err(io::Error::other)??;
        }
        Err(_) => {
            tracing::warn!(
                job_id = %spec.job_id,
                stage = %spec.stage,
                "Output pipes held open past the wall-clock limit by an escaped process"
            );
            stdout_task.abort();
            stderr_task.abort();
            timed_out = true;
        }
    }

    let stdout = stdout.take().await;
    let stderr = stderr.take().await;
    let (exit_code, signal) = exit_parts(status);
    Ok(ProcessOutcome {
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        timed_out,
        output_truncated: stdout.truncated || stderr.truncated,
        elapsed: started.elapsed(),
    })
}

/// Bytes retained from one stream.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    /// Something past the limit was discarded.
    truncated: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let keep = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..keep]);
        if keep < chunk.len() {
            self.truncated = true;
        }
    }
}

/// Capture shared with its reader task, so that an abandoned reader still
/// leaves behind what it read.
#[derive(Debug, Clone, Default)]
struct SharedCapture(Arc<Mutex<Capture>>);

impl SharedCapture {
    async fn take(&self) -> Capture {
        std::mem::take(&mut *self.0.lock().await)
    }
}

fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

fn kill_process_group(pid: Option<u32>) -> nix::Result<()> {
    let pid = pid.ok_or(nix::errno::Errno::ESRCH)?;
    killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
}

/// Read the stream to its end, keeping up to `limit` bytes and draining the
/// rest so the writer never blocks.
async fn read_capped<R>(reader: Option<R>, limit: usize, capture: SharedCapture) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        capture.0.lock().await.push(&chunk[..n], limit);
    }
}
