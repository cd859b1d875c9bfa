use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use uuid::Uuid;

use crate::config::{NodeConfig, ResourceLimits, SandboxBackend};
use crate::error::Result;
use crate::sandbox::{
    DockerSandbox, ProcessOutcome, ProcessSandbox, ProcessSpec, Sandbox, Stage,
};
use crate::scheduler::{ErrorKind, ExecutionOutcome};
use crate::toolchain::{Language, Toolchain};

/// Compiles and runs submitted source through a [`Sandbox`].
///
/// Success or failure is decided by exit status alone. Error-stream text from
/// a run that exits 0 (compiler warnings, logging) is kept as diagnostics and
/// does not fail the job.
#[derive(Clone)]
pub struct JobExecutor {
    sandbox: Arc<dyn Sandbox>,
    workspace_root: PathBuf,
    compile_limits: ResourceLimits,
    run_limits: ResourceLimits,
    keep_workspaces: bool,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("sandbox", &self.sandbox.name())
            .field("workspace_root", &self.workspace_root)
            .field("keep_workspaces", &self.keep_workspaces)
            .finish()
    }
}

impl JobExecutor {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        workspace_root: impl Into<PathBuf>,
        compile_limits: ResourceLimits,
        run_limits: ResourceLimits,
    ) -> Self {
        Self {
            sandbox,
            workspace_root: workspace_root.into(),
            compile_limits,
            run_limits,
            keep_workspaces: false,
        }
    }

    /// Build the executor and sandbox backend described by `config`.
    pub fn from_config(config: &NodeConfig) -> Self {
        let sandbox: Arc<dyn Sandbox> = match config.sandbox.backend {
            SandboxBackend::Process => Arc::new(
                ProcessSandbox::new().with_nproc_limit(config.sandbox.local_nproc_limit),
            ),
            SandboxBackend::Docker => Arc::new(DockerSandbox::new(config.sandbox.clone())),
        };
        Self::new(
            sandbox,
            config.workspace_dir.clone(),
            config.sandbox.compile.clone(),
            config.sandbox.run.clone(),
        )
        .with_keep_workspaces(config.keep_workspaces)
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn sandbox_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Materialize, compile and run one job.
    ///
    /// Program failures are reported inside the returned outcome; `Err` is
    /// reserved for faults of the executor itself (workspace I/O, a sandbox
    /// that cannot start a process).
    pub async fn execute(
        &self,
        job_id: Uuid,
        language: Language,
        source: &str,
    ) -> Result<ExecutionOutcome> {
        let toolchain = language.toolchain();
        let workspace = Workspace::create(&self.workspace_root, job_id, toolchain, source).await?;

        let result = self.execute_in(&workspace, job_id, toolchain).await;

        if !self.keep_workspaces {
            workspace.remove(job_id).await;
        }
        result
    }

    async fn execute_in(
        &self,
        workspace: &Workspace,
        job_id: Uuid,
        toolchain: &Toolchain,
    ) -> Result<ExecutionOutcome> {
        let stem = job_id.to_string();
        let mut warnings = None;

        if let Some(command) = toolchain.compile_command(&stem) {
            let spec = self.spec(job_id, Stage::Compile, toolchain, command, workspace, &self.compile_limits);
            let compiled = self.sandbox.run(&spec).await?;
            if let Some(failure) = classify_compile(&compiled, &self.compile_limits) {
                tracing::info!(
                    job_id = %job_id,
                    error_kind = ?failure.error_kind,
                    "Compilation failed, skipping run"
                );
                return Ok(failure);
            }
            warnings = non_empty(compiled.stderr);
        }

        let command = toolchain.run_command(&stem);
        let spec = self.spec(job_id, Stage::Run, toolchain, command, workspace, &self.run_limits);
        let ran = self.sandbox.run(&spec).await?;
        tracing::debug!(
            job_id = %job_id,
            exit_code = ?ran.exit_code,
            signal = ?ran.signal,
            elapsed_ms = ran.elapsed.as_millis() as u64,
            "Run finished"
        );

        let mut outcome = classify_run(ran, &self.run_limits);
        if outcome.error_kind.is_none() {
            outcome.diagnostics = join_diagnostics(warnings, outcome.diagnostics.take());
        }
        Ok(outcome)
    }

    fn spec(
        &self,
        job_id: Uuid,
        stage: Stage,
        toolchain: &Toolchain,
        command: Vec<String>,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> ProcessSpec {
        ProcessSpec {
            job_id,
            stage,
            language: toolchain.language,
            command,
            workdir: workspace.dir.clone(),
            limits: limits.clone(),
        }
    }
}

/// Job-scoped scratch directory `<root>/<job-id>/` holding the source file
/// and, for compiled languages, the artifact. Job ids are unique, so
/// concurrent jobs never share files.
struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    async fn create(
        root: &Path,
        job_id: Uuid,
        toolchain: &Toolchain,
        source: &str,
    ) -> std::io::Result<Self> {
        let dir = root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        match Self::populate(&dir, job_id, toolchain, source).await {
            Ok(workspace) => Ok(workspace),
            Err(e) => {
                // Half-built workspaces are never kept.
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    async fn populate(
        dir: &Path,
        job_id: Uuid,
        toolchain: &Toolchain,
        source: &str,
    ) -> std::io::Result<Self> {
        // Absolute path, so it can be bind-mounted into a container.
        let dir = tokio::fs::canonicalize(dir).await?;
        let file = dir.join(toolchain.source_file(&job_id.to_string()));
        tokio::fs::write(&file, source).await?;
        Ok(Self { dir })
    }

    async fn remove(&self, job_id: Uuid) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(
                job_id = %job_id,
                dir = %self.dir.display(),
                error = %e,
                "Failed to remove job workspace"
            );
        }
    }
}

/// `Some(failure)` when the compile step did not produce a usable artifact.
fn classify_compile(outcome: &ProcessOutcome, limits: &ResourceLimits) -> Option<ExecutionOutcome> {
    if outcome.succeeded() {
        return None;
    }
    if outcome.timed_out {
        return Some(ExecutionOutcome::failure(
            ErrorKind::Timeout,
            format!(
                "Compilation timed out after {} ms",
                limits.wall_time.as_millis()
            ),
            None,
        ));
    }
    if outcome.hit_resource_limit() {
        return Some(ExecutionOutcome::failure(
            ErrorKind::ResourceExceeded,
            limit_message(outcome, limits, "Compiler"),
            outcome.exit_code,
        ));
    }
    let diagnostic = non_empty(outcome.stderr.clone())
        .or_else(|| non_empty(outcome.stdout.clone()))
        .unwrap_or_else(|| format!("Compiler {}", status_line(outcome)));
    Some(ExecutionOutcome::failure(
        ErrorKind::CompileError,
        diagnostic,
        outcome.exit_code,
    ))
}

fn classify_run(outcome: ProcessOutcome, limits: &ResourceLimits) -> ExecutionOutcome {
    if outcome.timed_out {
        let mut message = format!("Time limit exceeded ({} ms)", limits.wall_time.as_millis());
        if let Some(stderr) = non_empty(outcome.stderr) {
            message.push('\n');
            message.push_str(&stderr);
        }
        return ExecutionOutcome::failure(ErrorKind::Timeout, message, None);
    }
    if outcome.hit_resource_limit() {
        return ExecutionOutcome::failure(
            ErrorKind::ResourceExceeded,
            limit_message(&outcome, limits, "Program"),
            outcome.exit_code,
        );
    }
    if outcome.succeeded() {
        return ExecutionOutcome::success(outcome.stdout, non_empty(outcome.stderr));
    }
    let status = status_line(&outcome);
    let message = non_empty(outcome.stderr).unwrap_or_else(|| format!("Program {}", status));
    ExecutionOutcome::failure(ErrorKind::RuntimeError, message, outcome.exit_code)
}

fn limit_message(outcome: &ProcessOutcome, limits: &ResourceLimits, who: &str) -> String {
    if outcome.output_truncated {
        return format!(
            "Output limit exceeded ({} bytes per stream)",
            limits.max_output_bytes
        );
    }
    match outcome.signal.and_then(|s| Signal::try_from(s).ok()) {
        Some(Signal::SIGXCPU) => format!("{} exceeded the CPU time limit", who),
        Some(Signal::SIGXFSZ) => format!("{} exceeded the file size limit", who),
        _ => format!("{} was killed (memory or process limit exceeded)", who),
    }
}

fn status_line(outcome: &ProcessOutcome) -> String {
    match (outcome.exit_code, outcome.signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => match Signal::try_from(sig) {
            Ok(signal) => format!("terminated by signal {} ({})", sig, signal.as_str()),
            Err(_) => format!("terminated by signal {}", sig),
        },
        (None, None) => "terminated abnormally".to_string(),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn join_diagnostics(first: Option<String>, second: Option<String>) -> Option<String> {
    match (first, second) {
        (Some(a), Some(b)) => Some(format!("{}\n{}", a.trim_end(), b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobStatus;
    use std::time::Duration;

    fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
        ProcessOutcome {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(3),
            ..Default::default()
        }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::run_defaults()
    }

    #[tokio::test]
    async fn failed_workspace_setup_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let toolchain = Language::Python.toolchain();
        // A directory where the source file should go makes the write fail.
        let blocker = root
            .path()
            .join(job_id.to_string())
            .join(toolchain.source_file(&job_id.to_string()));
        std::fs::create_dir_all(&blocker).unwrap();

        let created = Workspace::create(root.path(), job_id, toolchain, "print(1)").await;

        assert!(created.is_err());
        assert!(!root.path().join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn workspace_holds_the_source_file() {
        let root = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let toolchain = Language::Python.toolchain();

        let workspace = Workspace::create(root.path(), job_id, toolchain, "print(1)")
            .await
            .unwrap();
        let file = workspace.dir.join(toolchain.source_file(&job_id.to_string()));
        assert_eq!(std::fs::read_to_string(file).unwrap(), "print(1)");

        workspace.remove(job_id).await;
        assert!(!workspace.dir.exists());
    }

    #[test]
    fn clean_compile_passes_through() {
        assert!(classify_compile(&exited(0, "", ""), &limits()).is_none());
    }

    #[test]
    fn compiler_warnings_do_not_fail_the_build() {
        let warned = exited(0, "", "warning: unused variable 'x'");
        assert!(classify_compile(&warned, &limits()).is_none());
    }

    #[test]
    fn compiler_error_carries_diagnostic() {
        let failed = exited(1, "", "main.cpp:1:18: error: expected '}' at end of input");
        let outcome = classify_compile(&failed, &limits()).unwrap();
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::CompileError));
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.output.contains("expected '}'"));
    }

    #[test]
    fn silent_compiler_failure_reports_status() {
        let outcome = classify_compile(&exited(4, "", ""), &limits()).unwrap();
        assert_eq!(outcome.output, "Compiler exited with code 4");
    }

    #[test]
    fn compile_timeout_is_timeout() {
        let hung = ProcessOutcome {
            timed_out: true,
            signal: Some(Signal::SIGKILL as i32),
            ..Default::default()
        };
        let outcome = classify_compile(&hung, &limits()).unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn zero_exit_with_stderr_is_success() {
        let outcome = classify_run(exited(0, "42\n", "debug: hello"), &limits());
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.output, "42\n");
        assert_eq!(outcome.diagnostics.as_deref(), Some("debug: hello"));
    }

    #[test]
    fn non_zero_exit_is_runtime_error() {
        let outcome = classify_run(exited(3, "partial", "Traceback: boom"), &limits());
        assert_eq!(outcome.status, JobStatus::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RuntimeError));
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.output, "Traceback: boom");
    }

    #[test]
    fn crash_without_stderr_names_the_signal() {
        let crashed = ProcessOutcome {
            signal: Some(Signal::SIGSEGV as i32),
            ..Default::default()
        };
        let outcome = classify_run(crashed, &limits());
        assert_eq!(outcome.error_kind, Some(ErrorKind::RuntimeError));
        assert!(outcome.output.contains("SIGSEGV"), "{}", outcome.output);
    }

    #[test]
    fn runaway_run_is_timeout() {
        let hung = ProcessOutcome {
            timed_out: true,
            signal: Some(Signal::SIGKILL as i32),
            ..Default::default()
        };
        let outcome = classify_run(hung, &limits());
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert!(outcome.output.starts_with("Time limit exceeded"));
    }

    #[test]
    fn cpu_limit_is_resource_exceeded() {
        let spun = ProcessOutcome {
            signal: Some(Signal::SIGXCPU as i32),
            ..Default::default()
        };
        let outcome = classify_run(spun, &limits());
        assert_eq!(outcome.error_kind, Some(ErrorKind::ResourceExceeded));
        assert!(outcome.output.contains("CPU time"));
    }

    #[test]
    fn flooding_output_is_resource_exceeded() {
        let flooded = ProcessOutcome {
            output_truncated: true,
            ..exited(0, "yyyy", "")
        };
        let outcome = classify_run(flooded, &limits());
        assert_eq!(outcome.error_kind, Some(ErrorKind::ResourceExceeded));
    }

    #[test]
    fn diagnostics_are_joined() {
        assert_eq!(
            join_diagnostics(Some("w1\n".into()), Some("w2".into())).as_deref(),
            Some("w1\nw2")
        );
        assert_eq!(join_diagnostics(None, Some("w2".into())).as_deref(), Some("w2"));
        assert!(join_diagnostics(None, None).is_none());
    }
}
