//! seine - configuration-driven event-pipeline runtime.
//!
//! Startup is fail-fast with a distinct exit code per failure class, so
//! supervisors can tell an unusable command line from an unreadable or
//! unparseable configuration.

use clap::error::ErrorKind;
use clap::Parser;
use seine_cli::config::Document;
use seine_runtime::{topology, ExecutionContext};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const EXIT_OPTIONS: u8 = 1;
const EXIT_LOG_LEVEL: u8 = 2;
const EXIT_CONFIG_READ: u8 = 3;
const EXIT_CONFIG_PARSE: u8 = 4;
const EXIT_TOPOLOGY: u8 = 5;

#[derive(Parser)]
#[command(name = "seine")]
#[command(version)]
#[command(about = "Configuration-driven event-pipeline runtime", long_about = None)]
struct Cli {
    /// Topology configuration file (YAML)
    #[arg(required_unless_present = "example")]
    config: Option<PathBuf>,

    /// Log level: debug|info|critical
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Worker threads for the transport pool
    #[arg(long, default_value = "1")]
    io_threads: usize,

    /// Worker threads for the application pool
    #[arg(long, default_value = "1")]
    app_threads: usize,

    /// Seconds to wait for subscriptions to wind down on shutdown
    #[arg(long, default_value = "2")]
    shutdown_grace: u64,

    /// Print an example configuration and exit
    #[arg(long)]
    example: bool,
}

fn parse_log_level(level: &str) -> Option<Level> {
    match level {
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "critical" => Some(Level::ERROR),
        _ => None,
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_OPTIONS,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if cli.example {
        print!("{}", Document::example_yaml());
        return ExitCode::SUCCESS;
    }

    let Some(level) = parse_log_level(&cli.log_level) else {
        eprintln!("Error: unknown log level [{}]", cli.log_level);
        return ExitCode::from(EXIT_LOG_LEVEL);
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Error: failed to install logger");
        return ExitCode::from(EXIT_LOG_LEVEL);
    }

    let config_path = cli.config.expect("clap enforces the config argument");
    let content = match std::fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error: failed to read {}: {}", config_path.display(), e);
            return ExitCode::from(EXIT_CONFIG_READ);
        }
    };
    let document = match Document::from_str(&content) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_CONFIG_PARSE);
        }
    };
    if document.is_empty() {
        info!("configuration declares no nodes, nothing to do");
        return ExitCode::SUCCESS;
    }

    let context = ExecutionContext::new();
    let handles = match context.start(cli.io_threads, cli.app_threads) {
        Ok(handles) => handles,
        Err(e) => {
            error!("failed to start execution context: {}", e);
            return ExitCode::from(EXIT_TOPOLOGY);
        }
    };

    let topology = match topology::resolve(
        &handles,
        &document.services,
        &document.pipelines,
        &document.endpoints,
    ) {
        Ok(topology) => topology,
        Err(e) => {
            error!("failed to wire topology: {}", e);
            context.stop();
            return ExitCode::from(EXIT_TOPOLOGY);
        }
    };

    info!(
        subscriptions = topology.subscriptions().len(),
        "topology running, press ctrl-c to stop"
    );

    let grace = Duration::from_secs(cli.shutdown_grace);
    handles.app().block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to wait for shutdown signal: {}", e);
        }
        info!("shutting down");
        topology.shutdown(grace).await;
    });
    context.stop();

    ExitCode::SUCCESS
}
