use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use mcp_lens::{Dispatcher, Frontend, ProxyConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mcp-lens")]
#[command(about = "Aggregating MCP proxy with cached, explorable tool responses")]
#[command(version)]
struct Cli {
    /// Override config path (default: $CONFIG_FILE, then mcp.json in the
    /// working directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level: DEBUG, INFO, WARNING, ERROR, CRITICAL (default: $LOG_LEVEL,
    /// then INFO).
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("mcp-lens: failed to start runtime: {err}");
            return ExitCode::from(2);
        }
    };
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("CONFIG_FILE").map(PathBuf::from));

    let config = match load_config(config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "configuration error");
            return ExitCode::from(1);
        }
    };
    match config.path() {
        Some(path) => tracing::info!(path = %path.display(), "loaded configuration"),
        None => tracing::warn!("no mcp.json found; starting with no upstreams"),
    }

    let configured = config.upstreams().len();
    let dispatcher = Dispatcher::new(config.upstreams(), config.settings().clone());

    let ready = dispatcher.pool().start_all().await;
    tracing::info!(ready, configured, "upstream startup complete");
    if configured > 0 && ready == 0 {
        tracing::error!("no configured upstream could start");
        dispatcher.pool().shutdown().await;
        return ExitCode::from(2);
    }

    // stdout carries JSON-RPC; all logging goes to stderr.
    let frontend = Frontend::new(dispatcher.clone());
    let served = frontend.serve(tokio::io::stdin(), tokio::io::stdout()).await;

    dispatcher.pool().shutdown().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "frontend failed");
            ExitCode::from(2)
        }
    }
}

async fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<ProxyConfig> {
    let cwd = std::env::current_dir().context("determine working directory")?;
    ProxyConfig::load(&cwd, config_path).await
}

fn init_tracing(cli_level: Option<&str>) {
    let level = cli_level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "INFO".to_string());
    let directive = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        other => {
            eprintln!("mcp-lens: unknown log level {other:?}; using INFO");
            "info"
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("mcp_lens={directive},lens_jsonrpc={directive}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
