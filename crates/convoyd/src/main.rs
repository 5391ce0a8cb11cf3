//! convoyd — the Convoy rollout daemon.
//!
//! Runs a local cluster (one agent per configured host sharing a
//! redb-backed coordination store), takes leadership, and rolls the
//! configured job out across the deployment group.
//!
//! # Usage
//!
//! ```text
//! convoyd init --name web --image web:1.2 --hosts a,b,c,d
//! convoyd run --config convoy.toml
//! convoyd status --config convoy.toml
//! convoyd undeploy --config convoy.toml --hosts a,b
//! ```

mod cluster;
mod config;
mod runtime;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use convoy_rollout::{RolloutCoordinator, RolloutPhase, RolloutStatus};
use convoy_state::{LeaderLatch, LocalStore, StoreClient};

use crate::cluster::LocalCluster;
use crate::config::ConvoyConfig;

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy deployment rollout daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the local cluster and roll the configured job out.
    Run {
        #[arg(long, default_value = "convoy.toml")]
        config: PathBuf,

        /// Exit once the rollout finishes instead of keeping instances up.
        #[arg(long)]
        once: bool,
    },
    /// Print the rollout status rebuilt from the store.
    Status {
        #[arg(long, default_value = "convoy.toml")]
        config: PathBuf,
    },
    /// Remove the configured job from hosts (default: the whole group).
    Undeploy {
        #[arg(long, default_value = "convoy.toml")]
        config: PathBuf,

        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
    },
    /// Write a starter convoy.toml.
    Init {
        #[arg(long)]
        name: String,

        #[arg(long)]
        image: String,

        #[arg(long, value_delimiter = ',', required = true)]
        hosts: Vec<String>,

        #[arg(long, default_value = "convoy.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, once } => run(&config, once).await,
        Command::Status { config } => status(&config).await,
        Command::Undeploy { config, hosts } => undeploy(&config, hosts).await,
        Command::Init {
            name,
            image,
            hosts,
            output,
            force,
        } => init(&name, &image, &hosts, &output, force),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,convoyd=debug,convoy_agent=debug,convoy_rollout=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> anyhow::Result<(ConvoyConfig, LocalStore)> {
    let config = ConvoyConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let store = LocalStore::open(&db_path)?;
    info!(path = ?db_path, "coordination store opened");
    Ok((config, store))
}

async fn run(path: &Path, once: bool) -> anyhow::Result<()> {
    let (config, store) = load(path)?;
    info!(job = %config.job.name, group = %config.group.name, "convoyd starting");

    let cluster = LocalCluster::start(&config, store).await?;
    let coordinator = cluster.coordinator();
    let handle = coordinator.start(config.job.clone(), config.group.clone(), config.policy.clone())?;
    drop(coordinator);

    let mut feed = handle.subscribe();
    let progress = tokio::spawn(async move {
        while feed.changed().await.is_ok() {
            let status = feed.borrow_and_update().clone();
            info!(phase = ?status.phase, counts = ?status.counts(), "rollout progress");
        }
    });

    let status = tokio::select! {
        status = handle.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            progress.abort();
            cluster.shutdown().await?;
            return Ok(());
        }
    };
    progress.abort();
    print_status(&status)?;

    if !once && status.phase == RolloutPhase::Succeeded {
        info!("rollout finished, serving until Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }
    cluster.shutdown().await?;

    match status.phase {
        RolloutPhase::Succeeded => Ok(()),
        phase => anyhow::bail!("rollout did not succeed: {phase:?}"),
    }
}

async fn status(path: &Path) -> anyhow::Result<()> {
    let (config, store) = load(path)?;
    let client = StoreClient::new(Arc::new(store));
    let status = RolloutStatus::reconstruct(
        &client,
        &config.job.id(),
        &config.group.name,
        &config.group.hosts,
    )
    .await?;
    print_status(&status)
}

async fn undeploy(path: &Path, hosts: Vec<String>) -> anyhow::Result<()> {
    let (config, store) = load(path)?;
    let hosts = if hosts.is_empty() {
        config.group.hosts.clone()
    } else {
        hosts
    };

    let client = StoreClient::new(Arc::new(store));
    let latch = Arc::new(LeaderLatch::start(client.clone(), "convoyd-undeploy").await?);
    latch.await_leadership().await;
    let coordinator = RolloutCoordinator::new(client, latch.clone());
    let removed = coordinator.undeploy(&config.job.id(), &hosts).await?;
    drop(coordinator);
    info!(job = %config.job.id(), removed = removed.len(), "undeploy issued");
    println!("{}", serde_json::to_string_pretty(&removed)?);

    if let Ok(latch) = Arc::try_unwrap(latch) {
        latch.close().await?;
    }
    Ok(())
}

fn init(name: &str, image: &str, hosts: &[String], output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let config = ConvoyConfig::scaffold(name, image, hosts);
    config.job.validate()?;
    std::fs::write(output, config.to_toml_string()?)?;
    info!(path = %output.display(), "wrote config");
    Ok(())
}

fn print_status(status: &RolloutStatus) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}
