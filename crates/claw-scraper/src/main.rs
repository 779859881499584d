//! claw-scraper - Clawbernetes inference metrics scraper
//!
//! Discovers model-serving pods in each configured cluster, scrapes their
//! metrics together with node GPU telemetry, and writes per-pod and per-pool
//! rows to ClickHouse.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use claw_scraper::{
    ClickHouseSink, HttpFetcher, InMemoryPoolDirectory, KubeCluster, MemorySink, MetricsScraper,
    PoolSync, ScraperConfig, SinkBackend, StaticClusterRegistry,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "claw-scraper")]
#[command(about = "Clawbernetes inference metrics scraper")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scraper
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-scraper/config.toml")]
        config: PathBuf,

        /// Keep rows in memory instead of writing to the sink
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a config file and print a summary
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-scraper/config.toml")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/claw-scraper/config.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("claw_scraper=info".parse()?);
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }

    match cli.command {
        Commands::Run { config, dry_run } => run_scraper(&config, dry_run).await?,
        Commands::CheckConfig { config } => check_config(&config)?,
        Commands::InitConfig { output, force } => init_config(&output, force)?,
    }

    Ok(())
}

async fn run_scraper(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    info!(config = %config_path.display(), dry_run, "starting claw-scraper");

    let config = ScraperConfig::from_file(config_path)?;

    let mut clusters = Vec::with_capacity(config.clusters.len());
    for cluster in &config.clusters {
        clusters.push(KubeCluster::connect(cluster, &config.sync.inference_stack).await?);
    }
    info!(clusters = clusters.len(), pools = config.pools.len(), "loaded config");

    let sink = if dry_run {
        SinkBackend::Memory(MemorySink::new())
    } else {
        let sink_config = config
            .sink
            .as_ref()
            .context("[sink] section is required unless --dry-run is set")?;
        SinkBackend::ClickHouse(ClickHouseSink::from_config(sink_config)?)
    };

    let settings = config.scrape_settings();
    let pools = Arc::new(InMemoryPoolDirectory::with_pools(config.pools.clone()));
    let registry = Arc::new(StaticClusterRegistry::new(clusters));
    let fetcher = Arc::new(HttpFetcher::new(settings.pod_timeout)?);
    let sink = Arc::new(sink);

    let scraper = MetricsScraper::new(
        Arc::clone(&pools),
        Arc::clone(&registry),
        fetcher,
        Arc::clone(&sink),
        settings,
    )?;
    let sync = config
        .sync
        .enabled
        .then(|| PoolSync::new(Arc::clone(&registry), Arc::clone(&pools), config.sync_settings()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    let sync_rx = shutdown_rx.clone();
    tokio::join!(scraper.run(shutdown_rx), async {
        if let Some(sync) = &sync {
            sync.run(sync_rx).await;
        }
    });

    if let SinkBackend::Memory(memory) = sink.as_ref() {
        info!(
            pod_rows = memory.pod_rows().len(),
            rollups = memory.rollups().len(),
            "dry run finished"
        );
    }

    Ok(())
}

fn check_config(config_path: &Path) -> anyhow::Result<()> {
    let config = ScraperConfig::from_file(config_path)?;

    println!("Config OK: {}", config_path.display());
    println!("  interval:       {}s", config.interval_secs);
    println!("  staleness:      {}s", config.staleness_secs);
    println!("  pod timeout:    {}s", config.pod_timeout_secs);
    println!("  concurrency:    {}", config.max_concurrent_pod_scrapes);
    println!(
        "  pool sync:      {}",
        if config.sync.enabled {
            format!("every {}s", config.sync.interval_secs)
        } else {
            "disabled".to_string()
        }
    );
    match &config.sink {
        Some(sink) => println!("  sink:           {} (db {})", sink.url, sink.database),
        None => println!("  sink:           none (dry run only)"),
    }
    for cluster in &config.clusters {
        println!("  cluster:        {} -> {}", cluster.name, cluster.source());
    }
    for pool in &config.pools {
        println!("  pool:           {}/{}", pool.effective_namespace(), pool.name);
    }

    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let content = ScraperConfig::sample().to_toml()?;
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the clusters and sink sections, then run:");
    println!("  claw-scraper run --config {}", output.display());

    Ok(())
}
