//! codebox - restricted execution sandbox for student code.
//!
//! Usage:
//!   codebox serve [--port 8000]           # Start HTTP server
//!   codebox --run <FILE|->                # Run one submission and print its transcript

use std::io::Read;
use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use codebox::capabilities::CapabilitySet;
use codebox::config::SandboxConfig;
use codebox::gatekeeper::GatePolicy;
use codebox::harness;
use codebox::http_server;
use codebox::sandbox::{RunOptions, Sandbox};
use codebox::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "codebox")]
#[command(about = "Restricted execution sandbox for student code")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Run one submission from a file, or from stdin with `-`
    #[arg(long, value_name = "FILE")]
    run: Option<String>,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(clap::Args, Debug, Clone)]
struct SandboxArgs {
    /// Wall-clock budget per submission in milliseconds
    #[arg(long, default_value = "2000")]
    time_ms: u64,

    /// Transcript budget per submission in bytes
    #[arg(long, default_value = "65536")]
    output_bytes: usize,

    /// Address-space limit for each worker process in KiB
    #[arg(long, default_value = "1048576")]
    mem_kb: u64,

    /// Maximum number of submissions running at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Comma-separated builtins to expose instead of the standard set
    #[arg(long, value_delimiter = ',')]
    capabilities: Option<Vec<String>>,

    /// Comma-separated names not yet taught; using them is refused
    #[arg(long, value_delimiter = ',')]
    curriculum: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run one job read from stdin (spawned by the sandbox itself)
    #[command(hide = true)]
    Worker,
}

fn build_sandbox(args: SandboxArgs) -> Result<Sandbox, Box<dyn std::error::Error>> {
    let mut config = SandboxConfig::default();
    config.limits.time_ms = args.time_ms;
    config.limits.output_bytes = args.output_bytes;
    config.ceilings.time_ms = config.ceilings.time_ms.max(args.time_ms);
    config.ceilings.output_bytes = config.ceilings.output_bytes.max(args.output_bytes);
    config.worker.mem_kb = args.mem_kb;
    if let Some(n) = args.max_concurrent {
        config.max_concurrent = n;
    }
    if let Some(names) = args.capabilities {
        config.capabilities = Arc::new(CapabilitySet::from_names(names)?);
    }
    config.policy = GatePolicy::default().with_curriculum(args.curriculum);
    Ok(Sandbox::new(config)?)
}

fn read_submission(path: &str) -> std::io::Result<String> {
    if path == "-" {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        Ok(code)
    } else {
        std::fs::read_to_string(path)
    }
}

fn main() {
    let args = Args::parse();

    match args.command {
        // The worker streams JSON events over stdout and starts no runtime.
        Some(Commands::Worker) => exit(harness::worker_main()),
        Some(Commands::Serve { port, sandbox }) => serve(port, sandbox),
        None => match args.run {
            Some(path) => run_once(&path, args.sandbox),
            None => {
                eprintln!("Error: Use 'serve' subcommand or --run <FILE>");
                exit(1);
            }
        },
    }
}

fn runtime_and_sandbox(args: SandboxArgs) -> (tokio::runtime::Runtime, Sandbox) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        exit(1);
    });
    let sandbox = build_sandbox(args).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        exit(1);
    });
    (runtime, sandbox)
}

fn serve(port: u16, args: SandboxArgs) {
    let (runtime, sandbox) = runtime_and_sandbox(args);
    if let Err(e) = runtime.block_on(http_server::run_server(port, AppState::new(sandbox))) {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

fn run_once(path: &str, args: SandboxArgs) {
    let code = read_submission(path).unwrap_or_else(|e| {
        eprintln!("Error: reading {}: {}", path, e);
        exit(1);
    });
    let (runtime, sandbox) = runtime_and_sandbox(args);
    let evaluation = runtime.block_on(sandbox.execute(&code, RunOptions::default()));
    print!("{}", evaluation.transcript());
    exit(if evaluation.result.failed { 1 } else { 0 });
}
