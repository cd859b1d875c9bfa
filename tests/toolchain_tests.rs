//! Runs real compilers and interpreters through the process sandbox.
//! Each test is skipped when its toolchain is not installed.


use std::sync::Arc;

use coderun_lite::config::ResourceLimits;
use coderun_lite::sandbox::ProcessSandbox;
use coderun_lite::scheduler::{ErrorKind, JobStatus};
use coderun_lite::toolchain::Language;
use coderun_lite::worker::JobExecutor;
use test_harness::has_program;
use uuid::Uuid;

fn executor(root: &std::path::Path) -> JobExecutor {
    JobExecutor::new(
        Arc::new(ProcessSandbox::new()),
        root,
        ResourceLimits::compile_defaults(),
        ResourceLimits::run_defaults(),
    )
}

#[tokio::test]
async fn test_cpp_hello_world() {
    if !has_program("g++") {
        eprintln!("g++ not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = "#include <iostream>\nint main(){std::cout<<\"Hello, World!\";}";

    let outcome = executor(dir.path())
        .execute(Uuid::new_v4(), Language::Cpp, source)
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Success, "{:?}", outcome);
    assert_eq!(outcome.output, "Hello, World!");
}

#[tokio::test]
async fn test_cpp_syntax_error_is_compile_error() {
    if !has_program("g++") {
        eprintln!("g++ not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let source = "int main(){ return";

    let outcome = executor(dir.path())
        .execute(Uuid::new_v4(), Language::Cpp, source)
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error_kind, Some(ErrorKind::CompileError));
    assert!(outcome.output.contains("error"), "{}", outcome.output);
}

#[tokio::test]
async fn test_workspace_is_removed_after_run() {
    if !has_program("g++") {
        eprintln!("g++ not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let id = Uuid::new_v4();

    executor(dir.path())
        .execute(id, Language::Cpp, "int main() { return 0; }\n")
        .await
        .unwrap();

    assert!(!dir.path().join(id.to_string()).exists());
}

#[tokio::test]
async fn test_python_success_and_runtime_error() {
    if !has_program("python3") {
        eprintln!("python3 not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path());

    let ok = exec
        .execute(Uuid::new_v4(), Language::Python, "print(6 * 7)\n")
        .await
        .unwrap();
    assert_eq!(ok.status, JobStatus::Success, "{:?}", ok);
    assert_eq!(ok.output, "42\n");

    let failed = exec
        .execute(Uuid::new_v4(), Language::Python, "raise ValueError('boom')\n")
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.error_kind, Some(ErrorKind::RuntimeError));
    assert_eq!(failed.exit_code, Some(1));
    assert!(failed.output.contains("ValueError: boom"));
}
