use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CoderunError, Result};

/// Which containment mechanism runs submitted programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackend {
    /// Local child process in its own process group with rlimits applied.
    #[default]
    Process,
    /// `docker run` with network, capabilities and filesystem locked down.
    Docker,
}

/// Per-process resource envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock budget; the whole process group is killed when it expires.
    pub wall_time: Duration,
    /// RLIMIT_CPU in seconds.
    pub cpu_time_secs: Option<u64>,
    /// Address-space (process sandbox) or container memory limit, in bytes.
    pub memory_bytes: Option<u64>,
    /// Largest file the program may write, in bytes.
    pub file_size_bytes: Option<u64>,
    /// Per-container `--pids-limit`. The process backend applies it as
    /// RLIMIT_NPROC only when [`SandboxConfig::local_nproc_limit`] is set,
    /// since that rlimit counts every process of the service user.
    pub process_limit: Option<u64>,
    /// Bytes captured per stream before the run is flagged as over limit.
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    /// Envelope for running a submitted program.
    pub fn run_defaults() -> Self {
        Self {
            wall_time: Duration::from_secs(10),
            cpu_time_secs: Some(5),
            memory_bytes: Some(512 * 1024 * 1024),
            file_size_bytes: Some(16 * 1024 * 1024),
            process_limit: Some(64),
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Compilers need more headroom than the programs they build.
    pub fn compile_defaults() -> Self {
        Self {
            wall_time: Duration::from_secs(30),
            cpu_time_secs: Some(30),
            memory_bytes: Some(2 * 1024 * 1024 * 1024),
            file_size_bytes: Some(64 * 1024 * 1024),
            process_limit: Some(256),
            max_output_bytes: 256 * 1024,
        }
    }
}

/// Configuration for the execution sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Docker image overriding the per-language default
    pub image: Option<String>,
    /// Disable network access in container
    pub network_disabled: bool,
    /// CPU limit for containers (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Apply `process_limit` as RLIMIT_NPROC in the process backend. Only
    /// sound when the service runs under a dedicated user.
    pub local_nproc_limit: bool,
    pub compile: ResourceLimits,
    pub run: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Process,
            image: None,
            network_disabled: true,
            cpu_limit: Some("1".to_string()),
            local_nproc_limit: false,
            compile: ResourceLimits::compile_defaults(),
            run: ResourceLimits::run_defaults(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Number of concurrent workers draining the execution queue.
    pub workers: usize,
    /// Maximum number of jobs waiting in the execution queue.
    pub queue_capacity: usize,
    pub max_source_bytes: usize,
    /// Scratch root; each job gets `<workspace_dir>/<job-id>/`.
    pub workspace_dir: PathBuf,
    /// Leave job workspaces on disk after execution (debugging aid).
    pub keep_workspaces: bool,
    pub sandbox: SandboxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            workers: 4,
            queue_capacity: 256,
            max_source_bytes: 64 * 1024,
            workspace_dir: std::env::temp_dir().join("coderun"),
            keep_workspaces: false,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CoderunError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CoderunError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_source_bytes == 0 {
            return Err(CoderunError::Config(
                "max_source_bytes must be at least 1".into(),
            ));
        }
        for (stage, limits) in [("compile", &self.sandbox.compile), ("run", &self.sandbox.run)] {
            if limits.wall_time.is_zero() {
                return Err(CoderunError::Config(format!(
                    "{stage} wall-clock limit must be positive"
                )));
            }
            if limits.max_output_bytes == 0 {
                return Err(CoderunError::Config(format!(
                    "{stage} output limit must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.backend, SandboxBackend::Process);
        assert!(cfg.image.is_none());
        assert!(cfg.network_disabled);
        assert_eq!(cfg.cpu_limit.as_deref(), Some("1"));
        assert!(cfg.compile.wall_time > cfg.run.wall_time);
        assert!(!cfg.local_nproc_limit);
    }

    #[test]
    fn default_limits_bound_process_count() {
        assert_eq!(ResourceLimits::run_defaults().process_limit, Some(64));
        assert!(ResourceLimits::compile_defaults().process_limit.is_some());
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:5000");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.queue_capacity, 256);
        assert_eq!(cfg.max_source_bytes, 64 * 1024);
        assert!(!cfg.keep_workspaces);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = NodeConfig::new(addr)
            .with_workers(2)
            .with_queue_capacity(8)
            .with_workspace_dir("/tmp/x");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.workspace_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn validate_rejects_zero_workers_and_capacity() {
        assert!(NodeConfig::default().with_workers(0).validate().is_err());
        assert!(NodeConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn validate_rejects_zero_time_limit() {
        let mut sandbox = SandboxConfig::default();
        sandbox.run.wall_time = Duration::ZERO;
        let err = NodeConfig::default()
            .with_sandbox(sandbox)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("run wall-clock"));
    }
}
