mod cli;

use std::env;
use std::time::Duration;

use anyhow::Result;
use calcflow_core::Operation;
use calcflow_server::audit::AuditFilter;
use calcflow_server::config::loader::load_config;
use calcflow_server::{AuditStore, IdentityVerifier, ServiceRuntime};
use clap::Parser;
use colored::Colorize;

use cli::{Cli, Commands, ComputeArgs, ConsumeArgs, HistoryArgs};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From CALCFLOW_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (calcflow.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (CALCFLOW_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    calcflow_server::observability::init_tracing();

    let cli = Cli::parse();
    let (config_path, source) = resolve_config_path(cli.config.clone());

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            print_error(&format!("Configuration error: {e}"));
            std::process::exit(2);
        }
    };

    tracing::info!(path = %config_path, source = %source, "Configuration loaded");

    calcflow_server::observability::apply_logging_level(&cfg.logging.level);
    if cfg.metrics.enabled {
        calcflow_server::metrics::init_metrics(&cfg.metrics.listen);
    }

    let runtime = match ServiceRuntime::bootstrap(&cfg).await {
        Ok(r) => r,
        Err(e) => {
            print_error(&format!("Startup failed: {e}"));
            std::process::exit(2);
        }
    };

    let outcome = run(&runtime, cli.command).await;
    runtime.shutdown().await;

    if let Err(e) = outcome {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(runtime: &ServiceRuntime, command: Commands) -> Result<()> {
    match command {
        Commands::Compute(args) => compute(runtime, args).await,
        Commands::Token(args) => {
            runtime.audit().register_requester(&args.username).await?;
            let token = runtime.identity().issue(&args.username)?;
            println!("{token}");
            Ok(())
        }
        Commands::History(args) => history(runtime, args).await,
        Commands::Consume(args) => consume(runtime, args).await,
    }
}

async fn compute(runtime: &ServiceRuntime, args: ComputeArgs) -> Result<()> {
    let operands: Vec<&str> = args.operands.iter().map(String::as_str).collect();
    let operation = Operation::parse(args.operation, &operands)?;

    if args.register {
        let requester = runtime.identity().resolve(&args.token)?;
        runtime.audit().register_requester(requester.as_str()).await?;
    }

    let result = runtime
        .orchestrator()
        .execute_with_token(&args.token, operation)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn history(runtime: &ServiceRuntime, args: HistoryArgs) -> Result<()> {
    let filter = AuditFilter {
        requester: args.requester,
        operation: args.operation,
        limit: args.limit,
    };
    let records = runtime.orchestrator().history(&filter).await?;

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn consume(runtime: &ServiceRuntime, args: ConsumeArgs) -> Result<()> {
    runtime.start_ingest().await?;
    println!(
        "{} consuming '{}' (Ctrl-C to stop)",
        "→".cyan(),
        runtime.config().broker.topic
    );

    let period = Duration::from_secs(args.print_every.unwrap_or(0).max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            ended = runtime.ingest_finished() => {
                ended?;
                break;
            }
            _ = ticker.tick(), if args.print_every.is_some() => {
                let ring = runtime.ring();
                tracing::info!(buffered = ring.len(), evicted = ring.evicted(), "Event buffer");
            }
        }
    }

    for event in runtime.ring().snapshot() {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: CALCFLOW_CONFIG
/// 3. Default: calcflow.toml
fn resolve_config_path(cli_arg: Option<String>) -> (String, ConfigSource) {
    if let Some(path) = cli_arg {
        return (path, ConfigSource::CliArgument);
    }

    if let Ok(path) = env::var("CALCFLOW_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("calcflow.toml".to_string(), ConfigSource::Default)
}
