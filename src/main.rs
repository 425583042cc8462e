use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use advanced_metrics::config::Config;
use advanced_metrics::export::health::HealthMetrics;
use advanced_metrics::pipeline::Pipeline;
use advanced_metrics::publisher::MetricSet;

/// Aggregates NGINX request metrics received over a Unix socket.
#[derive(Parser)]
#[command(name = "advanced-metrics", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("advanced-metrics {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validating default config")?;
            cfg
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        address = %cfg.address.display(),
        "starting advanced-metrics",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let health = if cfg.health.enabled {
        let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        health.start().await.context("starting health server")?;
        Some(health)
    } else {
        None
    };

    let mut pipeline = Pipeline::from_config(&cfg, health.clone())?;
    let output = pipeline
        .take_output()
        .context("pipeline output already taken")?;
    let consumer = tokio::spawn(consume(output));

    let result = pipeline.run(cancel).await;

    if let Err(e) = consumer.await {
        tracing::error!(error = %e, "output consumer panicked");
    }
    if let Some(health) = health {
        health.stop().await?;
    }

    tracing::info!("advanced-metrics stopped");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "registering SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel.cancel();
    });
}

/// Logs a summary of every published batch until the pipeline stops.
async fn consume(mut output: mpsc::Receiver<Vec<MetricSet>>) {
    while let Some(batch) = output.recv().await {
        let mut totals: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for set in &batch {
            for metric in &set.metrics {
                let entry = totals.entry(metric.name.as_str()).or_default();
                entry.0 += metric.values.count;
                entry.1 += metric.values.sum;
            }
        }

        tracing::info!(metric_sets = batch.len(), "published metrics batch");
        for (name, (count, sum)) in totals {
            tracing::debug!(metric = name, count, sum, "metric totals");
        }
    }
}
