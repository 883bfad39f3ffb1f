use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use node_worker::worker::{run_task_process, TASK_PROCESS_FLAG};
use node_worker::{logging, node};
use node_worker_config::{WorkerConfig, DEFAULT_CONFIG_PATH};
use node_worker_types::TaskName;

#[derive(Parser, Debug)]
#[command(name = "node-worker", version, about = "Worker node for a distributed GPU compute network")]
struct Cli {
    /// JSON configuration file. Missing file means defaults.
    #[arg(long, env = "NODE_WORKER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Server URL (ws:// or wss://), overrides the config file.
    #[arg(long, env = "NODE_WORKER_URL")]
    node_url: Option<String>,

    /// Log level, overrides the config file.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    // Check for --task-process BEFORE parsing the CLI.
    // Task processes are this binary re-executed by the orchestrator and
    // take their configuration from stdin.
    let args: Vec<String> = std::env::args().collect();
    if let Some(kind) = args
        .windows(2)
        .find(|w| w[0] == TASK_PROCESS_FLAG)
        .map(|w| w[1].as_str())
    {
        let kind = match kind.parse::<TaskName>() {
            Ok(kind) => kind,
            Err(e) => {
                eprintln!("[TASK_PROCESS] {e}");
                return ExitCode::from(2);
            }
        };
        return match run_task_process(kind) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("[TASK_PROCESS] {kind} process failed: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("node-worker: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_file(&cli.config)?;
    config.apply_env(std::env::vars())?;
    if let Some(url) = cli.node_url {
        config.node_url = url;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.validate()?;

    if let Err(e) = logging::setup_logging(&config.log, &config.log.filename) {
        eprintln!("Failed to set up logging: {e}");
    }
    log::info!("[MAIN] node-worker {} starting", node::VERSION);

    node::run_node(&config)
}
