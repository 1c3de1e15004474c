use crate::cluster::KubeCluster;
use crate::config::{LogFormat, LoggerConfig};
use crate::detector::{Denylist, Detector};
use crate::lister::Lister;
use crate::patcher::Patcher;
use crate::scanner::ScanContext;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

mod cluster;
mod config;
mod detector;
mod error;
mod lister;
mod owner;
mod patcher;
mod scanner;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Finds workloads running vulnerable log4j images and restarts them with message lookups disabled.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Log at debug level regardless of the configured level
    #[arg(short = 'D', long)]
    debug: bool,

    /// Compute patches without updating any workload
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(logger: &LoggerConfig, debug: bool) -> anyhow::Result<()> {
    let level = if debug { "debug" } else { logger.level.as_str() };
    let default_level: LevelFilter = level
        .parse()
        .with_context(|| format!("Invalid log level {}", level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match logger.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    init_logging(&config.logger, cli.debug)?;
    info!("Starting kube-log4j-fix {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config from file {}", cli.config.display());

    let denylist = Denylist::new(config.clue.images);
    if denylist.is_empty() {
        warn!("No vulnerable images configured, nothing will be detected");
    } else {
        info!("Checking containers against {} vulnerable images", denylist.len());
    }

    let client = cluster::create_client(config.main.kube_config.as_deref()).await?;
    let cluster = KubeCluster::new(client);
    let ctx = ScanContext {
        lister: Lister::default(),
        detector: Detector::new(denylist),
        patcher: Patcher::new(cli.dry_run),
    };

    let summary = scanner::run(&ctx, &cluster).await?;
    info!(
        workloads = summary.workloads,
        pods = summary.pods,
        fixed = summary.fixed,
        unsupported = summary.unsupported,
        "Done"
    );

    Ok(())
}
