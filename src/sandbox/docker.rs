use std::io;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::{getgid, getuid};
use tokio::process::Command;

use super::{supervise, ProcessOutcome, ProcessSpec, Sandbox};
use crate::config::SandboxConfig;

const CONTAINER_WORKDIR: &str = "/workspace";

/// Docker reports a container killed by signal `n` as exit code `128 + n`.
const SIGNAL_EXIT_BASE: i32 = 128;

/// Exit code of a container whose main process got SIGKILL.
const SIGKILL_EXIT: i32 = SIGNAL_EXIT_BASE + Signal::SIGKILL as i32;

/// Runs each step in a throwaway Docker container.
///
/// Every container gets:
/// - Network isolation (disabled by default)
/// - Dropped capabilities and `no-new-privileges`
/// - Read-only root filesystem, with only the job workspace mounted writable
/// - Memory, CPU and pid limits
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: SandboxConfig,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn container_name(spec: &ProcessSpec) -> String {
        format!("coderun-{}-{}", spec.job_id, spec.stage)
    }

    fn image<'a>(&'a self, spec: &ProcessSpec) -> &'a str {
        self.config
            .image
            .as_deref()
            .unwrap_or(spec.language.toolchain().image)
    }

    /// Arguments for `docker`, ending with the image and the command.
    pub fn docker_args(&self, spec: &ProcessSpec) -> Vec<String> {
        let limits = &spec.limits;
        // No `--rm`: the container is inspected, then removed, after it exits.
        let mut args = vec![
            "run".to_string(),
            format!("--name={}", Self::container_name(spec)),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(bytes) = limits.memory_bytes {
            args.push(format!("--memory={}", bytes));
            args.push(format!("--memory-swap={}", bytes));
        }
        if let Some(ref cpus) = self.config.cpu_limit {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(count) = limits.process_limit {
            args.push(format!("--pids-limit={}", count));
        }
        if let Some(secs) = limits.cpu_time_secs {
            args.push(format!("--ulimit=cpu={}:{}", secs, secs + 1));
        }
        if let Some(bytes) = limits.file_size_bytes {
            args.push(format!("--ulimit=fsize={}:{}", bytes, bytes));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());
        args.push("--tmpfs=/tmp:rw,size=64m".to_string());

        // Run as the service user so the host can clean the workspace up.
        args.push(format!("--user={}:{}", getuid(), getgid()));
        args.push(format!(
            "--volume={}:{}:rw",
            spec.workdir.display(),
            CONTAINER_WORKDIR
        ));
        args.push(format!("--workdir={}", CONTAINER_WORKDIR));
        args.push(format!("--env=HOME={}", CONTAINER_WORKDIR));

        args.push(self.image(spec).to_string());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Whether the kernel OOM killer stopped the container.
    async fn oom_killed(&self, spec: &ProcessSpec) -> bool {
        let name = Self::container_name(spec);
        match Command::new("docker")
            .args(["inspect", "--format", "{{.State.OOMKilled}}", &name])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Ok(output) => {
                tracing::warn!(
                    job_id = %spec.job_id,
                    container = %name,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "Failed to inspect container"
                );
                false
            }
            Err(e) => {
                tracing::warn!(job_id = %spec.job_id, error = %e, "Failed to invoke docker inspect");
                false
            }
        }
    }

    async fn remove_container(&self, spec: &ProcessSpec) {
        let name = Self::container_name(spec);
        match Command::new("docker")
            .args(["rm", "--force", &name])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                tracing::debug!(job_id = %spec.job_id, container = %name, "Removed container");
            }
            Ok(output) => tracing::warn!(
                job_id = %spec.job_id,
                container = %name,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Failed to remove container"
            ),
            Err(e) => tracing::warn!(
                job_id = %spec.job_id,
                container = %name,
                error = %e,
                "Failed to invoke docker rm"
            ),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: &ProcessSpec) -> io::Result<ProcessOutcome> {
        if spec.command.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        }

        let mut command = Command::new("docker");
        command.args(self.docker_args(spec));

        tracing::debug!(
            job_id = %spec.job_id,
            stage = %spec.stage,
            image = %self.image(spec),
            "Starting container"
        );

        let supervised = supervise(command, spec).await;
        let mut outcome = match supervised {
            Ok(outcome) => outcome,
            Err(e) => {
                self.remove_container(spec).await;
                return Err(e);
            }
        };
        if !outcome.timed_out {
            let oom_killed =
                outcome.exit_code == Some(SIGKILL_EXIT) && self.oom_killed(spec).await;
            translate_signal_exit(&mut outcome, oom_killed);
        }
        // Killing the docker client on timeout leaves the container running.
        self.remove_container(spec).await;
        Ok(outcome)
    }
}

/// Map the exit codes docker uses for limit-related kills back to signals.
///
/// 137 counts as SIGKILL only when docker confirms an OOM kill, so a program
/// that calls `exit(137)` stays a plain runtime error. 152 (SIGXCPU) and
/// 153 (SIGXFSZ) cannot be told apart from an explicit `exit` with the same
/// code and are always read as the rlimit signal.
fn translate_signal_exit(outcome: &mut ProcessOutcome, oom_killed: bool) {
    let Some(code) = outcome.exit_code else {
        return;
    };
    let signal = match code {
        SIGKILL_EXIT if oom_killed => Signal::SIGKILL,
        c if c == SIGNAL_EXIT_BASE + Signal::SIGXCPU as i32 => Signal::SIGXCPU,
        c if c == SIGNAL_EXIT_BASE + Signal::SIGXFSZ as i32 => Signal::SIGXFSZ,
        _ => return,
    };
    outcome.signal = Some(signal as i32);
    outcome.exit_code = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use crate::sandbox::Stage;
    use crate::toolchain::Language;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn spec() -> ProcessSpec {
        ProcessSpec {
            job_id: Uuid::nil(),
            stage: Stage::Run,
            language: Language::Python,
            command: vec!["python3".into(), "-B".into(), "x.py".into()],
            workdir: PathBuf::from("/srv/jobs/x"),
            limits: ResourceLimits::run_defaults(),
        }
    }

    #[test]
    fn args_lock_the_container_down() {
        let sandbox = DockerSandbox::new(SandboxConfig::default());
        let args = sandbox.docker_args(&spec());

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--volume=/srv/jobs/x:/workspace:rw".to_string()));
        assert!(args.contains(&format!("--memory={}", 512 * 1024 * 1024)));
        assert!(args.contains(&"--ulimit=cpu=5:6".to_string()));
        assert!(args.contains(&"--pids-limit=64".to_string()));
        assert!(!args.contains(&"--rm".to_string()));
        assert!(args.contains(&format!("--name=coderun-{}-run", Uuid::nil())));
    }

    #[test]
    fn command_follows_default_image() {
        let sandbox = DockerSandbox::new(SandboxConfig::default());
        let args = sandbox.docker_args(&spec());
        let tail = &args[args.len() - 4..];
        assert_eq!(tail, ["python:3.12-slim", "python3", "-B", "x.py"]);
    }

    #[test]
    fn image_override_and_network_toggle() {
        let config = SandboxConfig {
            image: Some("custom:1".into()),
            network_disabled: false,
            ..Default::default()
        };
        let args = DockerSandbox::new(config).docker_args(&spec());
        assert!(args.contains(&"custom:1".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--network")));
    }

    #[test]
    fn oom_exit_code_becomes_sigkill() {
        let mut outcome = ProcessOutcome {
            exit_code: Some(137),
            ..Default::default()
        };
        translate_signal_exit(&mut outcome, true);
        assert_eq!(outcome.signal, Some(Signal::SIGKILL as i32));
        assert!(outcome.hit_resource_limit());

        let mut plain = ProcessOutcome {
            exit_code: Some(1),
            ..Default::default()
        };
        translate_signal_exit(&mut plain, false);
        assert_eq!(plain.exit_code, Some(1));
        assert!(plain.signal.is_none());
    }

    #[test]
    fn explicit_exit_137_is_not_a_resource_limit() {
        let mut outcome = ProcessOutcome {
            exit_code: Some(137),
            ..Default::default()
        };
        translate_signal_exit(&mut outcome, false);
        assert_eq!(outcome.exit_code, Some(137));
        assert!(outcome.signal.is_none());
        assert!(!outcome.hit_resource_limit());
    }

    #[test]
    fn cpu_rlimit_exit_becomes_sigxcpu() {
        let mut outcome = ProcessOutcome {
            exit_code: Some(152),
            ..Default::default()
        };
        translate_signal_exit(&mut outcome, false);
        assert_eq!(outcome.signal, Some(Signal::SIGXCPU as i32));
        assert!(outcome.hit_resource_limit());
    }
}
