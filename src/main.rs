use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, subscriber, Level};
use tracing_log::LogTracer;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[cfg(feature = "metrics")]
use lakeward::config::context::setup_metrics;
use lakeward::config::{context::build_context, schema::load_config};

#[derive(Debug, Parser)]
#[clap(name = "lakeward", about = "Metadata governance core", version)]
struct Args {
    #[clap(short, long, default_value = "lakeward.toml")]
    config_path: PathBuf,

    #[clap(long, help = "Emit logs as JSON")]
    json_logs: bool,

    #[clap(long, help = "Run a single reclamation pass and exit")]
    reclaim_once: bool,
}

fn prepare_tracing(json_logs: bool) {
    // Pick up `log` records, e.g. from sqlx
    LogTracer::init().expect("Failed to set up the log bridge");

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(Level::INFO).into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        subscriber::set_global_default(builder.json().finish())
    } else {
        subscriber::set_global_default(builder.finish())
    }
    .expect("Failed to set up tracing");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    prepare_tracing(args.json_logs);

    info!("Starting lakeward {}", env!("CARGO_PKG_VERSION"));
    let config = load_config(&args.config_path).expect("Error loading config");

    #[cfg(feature = "metrics")]
    if let Some(ref metrics) = config.misc.metrics {
        setup_metrics(metrics);
    }

    let context = build_context(config)
        .await
        .expect("Error building the governance context");

    if args.reclaim_once {
        match context.reclaimer.run_once().await {
            Ok(counts) => {
                let removed: u64 = counts.values().sum();
                info!(removed, "Reclamation pass finished");
            }
            Err(e) => {
                error!("Reclamation pass failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let reclamation = context.spawn_reclamation();
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
    }
    info!("Shutting down");
    if let Some(task) = reclamation {
        task.abort();
    }
}
