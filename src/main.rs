use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use coderun_lite::config::{NodeConfig, ResourceLimits, SandboxBackend, SandboxConfig};
use coderun_lite::node::Node;
use coderun_lite::shutdown::install_shutdown_handler;
use coderun_lite::toolchain::Language;

#[derive(Parser, Debug)]
#[command(name = "coderun-lite")]
#[command(version)]
#[command(about = "Compile and run untrusted code asynchronously behind an HTTP API")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and worker pool
    Server(ServerArgs),

    /// List the supported languages
    Languages {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, env = "CODERUN_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for the HTTP API
    #[arg(long, env = "CODERUN_PORT", default_value = "5000")]
    port: u16,

    /// Number of concurrent workers
    #[arg(long, env = "CODERUN_WORKERS", default_value = "4")]
    workers: usize,

    /// Maximum number of jobs waiting for a worker
    #[arg(long, env = "CODERUN_QUEUE_CAPACITY", default_value = "256")]
    queue_capacity: usize,

    /// Largest accepted source file, in bytes
    #[arg(long, default_value = "65536")]
    max_source_bytes: usize,

    /// Scratch directory for job workspaces (default: <tmp>/coderun)
    #[arg(long, env = "CODERUN_WORKSPACE")]
    workspace_dir: Option<PathBuf>,

    /// Keep job workspaces after execution
    #[arg(long)]
    keep_workspaces: bool,

    // === Sandbox Options ===
    /// Containment backend for submitted programs
    #[arg(long, env = "CODERUN_SANDBOX", default_value = "process")]
    sandbox: SandboxKind,

    /// Docker image to use instead of the per-language default
    #[arg(long)]
    image: Option<String>,

    /// Give containers network access (disabled by default)
    #[arg(long)]
    allow_network: bool,

    /// CPU share per container (e.g. "0.5")
    #[arg(long, default_value = "1")]
    cpus: String,

    /// Wall-clock limit for the compile step, in milliseconds
    #[arg(long, default_value = "30000")]
    compile_timeout_ms: u64,

    /// Wall-clock limit for the run step, in milliseconds
    #[arg(long, default_value = "10000")]
    run_timeout_ms: u64,

    /// CPU time limit for the run step, in seconds
    #[arg(long, default_value = "5")]
    cpu_time_secs: u64,

    /// Memory limit for the run step, in MiB
    #[arg(long, default_value = "512")]
    memory_mb: u64,

    /// Captured output per stream, in KiB
    #[arg(long, default_value = "1024")]
    max_output_kb: usize,

    /// Maximum number of processes in a run container
    #[arg(long, default_value = "64")]
    process_limit: u64,

    /// Also enforce --process-limit as RLIMIT_NPROC in the process sandbox
    /// (counts every process of the service user)
    #[arg(long)]
    local_nproc_limit: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SandboxKind {
    Process,
    Docker,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct LanguageOutput {
    id: &'static str,
    extension: &'static str,
    compile: Option<String>,
    run: String,
    image: &'static str,
}

impl ServerArgs {
    fn into_config(self) -> NodeConfig {
        let run = ResourceLimits {
            wall_time: Duration::from_millis(self.run_timeout_ms),
            cpu_time_secs: Some(self.cpu_time_secs),
            memory_bytes: Some(self.memory_mb * 1024 * 1024),
            process_limit: Some(self.process_limit),
            max_output_bytes: self.max_output_kb * 1024,
            ..ResourceLimits::run_defaults()
        };
        let compile = ResourceLimits {
            wall_time: Duration::from_millis(self.compile_timeout_ms),
            ..ResourceLimits::compile_defaults()
        };

        let sandbox = SandboxConfig {
            backend: match self.sandbox {
                SandboxKind::Process => SandboxBackend::Process,
                SandboxKind::Docker => SandboxBackend::Docker,
            },
            image: self.image,
            network_disabled: !self.allow_network,
            cpu_limit: Some(self.cpus),
            local_nproc_limit: self.local_nproc_limit,
            compile,
            run,
        };

        let mut config = NodeConfig::new(SocketAddr::new(self.host, self.port))
            .with_workers(self.workers)
            .with_queue_capacity(self.queue_capacity)
            .with_sandbox(sandbox);
        config.max_source_bytes = self.max_source_bytes;
        config.keep_workspaces = self.keep_workspaces;
        if let Some(dir) = self.workspace_dir {
            config = config.with_workspace_dir(dir);
        }
        config
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    if config.sandbox.backend == SandboxBackend::Process {
        tracing::warn!(
            "Process sandbox does not isolate network or filesystem access. \
             Consider --sandbox docker for untrusted workloads."
        );
    }

    let node = Node::new(config)?;
    let shutdown = install_shutdown_handler()?;
    node.run(shutdown).await?;
    Ok(())
}

fn print_languages(output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let languages: Vec<LanguageOutput> = Language::ALL
        .iter()
        .map(|lang| {
            let toolchain = lang.toolchain();
            LanguageOutput {
                id: lang.id(),
                extension: toolchain.extension,
                compile: toolchain.compile_command("main").map(|c| c.join(" ")),
                run: toolchain.run_command("main").join(" "),
                image: toolchain.image,
            }
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&languages)?),
        OutputFormat::Table => {
            println!("{:<6} {:<5} {:<48} {}", "ID", "EXT", "COMPILE", "RUN");
            for lang in &languages {
                println!(
                    "{:<6} {:<5} {:<48} {}",
                    lang.id,
                    lang.extension,
                    lang.compile.as_deref().unwrap_or("-"),
                    lang.run
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Languages { output } => print_languages(&output)?,
    }

    Ok(())
}
