use std::path::PathBuf;
use std::sync::{atomic::AtomicBool, Arc};

use clap::Parser;
use composite_operator::config::OperatorConfig;
use composite_operator::logging::{init_logging, LogFormat};
use composite_operator::telemetry::{self, Metrics, ProbeState};
use composite_operator::controller;
use kube::Client;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "composite-operator", version, about = "Reconciles CompositeApp resources")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Auto)]
    log_format: LogFormat,
    /// TOML config file
    #[arg(long, env = "COMPOSITE_OPERATOR_CONFIG")]
    config: Option<PathBuf>,
    /// Only watch this namespace (overrides config)
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;
    let mut config = OperatorConfig::load(cli.config.as_deref())?;
    if let Some(ns) = cli.namespace { config.namespace = Some(ns); }

    let metrics = Arc::new(Metrics::new()?);
    let ready = Arc::new(AtomicBool::new(false));
    let listener = tokio::net::TcpListener::bind(config.metrics_addr).await?;
    info!(addr=%config.metrics_addr, "probes.listening");
    let router = telemetry::router(ProbeState { metrics: metrics.clone(), ready: ready.clone() });
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await { warn!(error=%e, "probes.server_failed"); }
    });

    let client = Client::try_default().await?;
    info!(namespace=?config.namespace, concurrency=config.max_concurrent_reconciles, "operator.starting");
    controller::run(client, config, metrics, ready).await
}
