//! QuorumIO Volume Group Simulation
//!
//! Runs a volume group over an in-memory replica cluster: opens the group
//! through the client dispatcher, commits blob transactions, takes one
//! replica offline, keeps writing on the remaining quorum, brings the
//! replica back through the rejoin handshake and prints the group state.

use anyhow::{Result, bail};
use bytes::Bytes;
use clap::Parser;
use quorumio_client::{EpochTracker, VolumeDispatcher};
use quorumio_common::{Config, Epoch, MsgType, ServiceId, VolumeId};
use quorumio_volumegroup::{AccessMode, GroupDeps, MemoryCluster, ReplicaBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VOLUME: VolumeId = VolumeId::new(1);

#[derive(Parser, Debug)]
#[command(name = "quorumio-sim")]
#[command(about = "QuorumIO volume group simulation")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of replicas in the group
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Write quorum (overrides the config file)
    #[arg(long)]
    quorum: Option<u32>,

    /// Transactions committed in each phase
    #[arg(long, default_value = "8")]
    writes: usize,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(quorum) = args.quorum {
        config.volume_group.quorum_count = quorum;
        config.validate()?;
    }

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    let quorum = config.volume_group.quorum_count as usize;
    if args.replicas < quorum {
        bail!("{} replicas cannot form a quorum of {}", args.replicas, quorum);
    }
    info!(
        "Starting QuorumIO simulation: {} replicas, quorum {}",
        args.replicas, quorum
    );

    let cluster = MemoryCluster::new(args.replicas, quorum);
    cluster.create_volume(VOLUME);
    let epochs = EpochTracker::new(Epoch::new(1));
    let dispatcher = VolumeDispatcher::new(
        ServiceId::new(),
        &config,
        GroupDeps::new(cluster.clone(), cluster.clone()),
        Arc::clone(&epochs),
    );

    let opened = dispatcher.open_volume(VOLUME, AccessMode::ReadWrite).await?;
    info!(
        "Volume {} open with {} functional replicas",
        VOLUME,
        opened.group.functional.len()
    );

    commit_blobs(&dispatcher, "healthy", args.writes).await?;

    // Take the last replica down and keep writing on the rest
    let Some(&lagging) = cluster.replica_ids().last() else {
        bail!("cluster has no replicas");
    };
    cluster.set_behavior(lagging, ReplicaBehavior::Offline);
    info!("Replica {} offline", lagging.short());
    commit_blobs(&dispatcher, "degraded", args.writes).await?;

    // Rebalance while the replica is away
    epochs.advance(Epoch::new(2))?;
    cluster.set_epoch(Epoch::new(2));
    commit_blobs(&dispatcher, "rebalanced", args.writes).await?;

    cluster.set_behavior(lagging, ReplicaBehavior::Healthy);
    let group = dispatcher.group(VOLUME)?;
    match cluster.rejoin(lagging, &group).await {
        Ok(()) => info!("Replica {} rejoined", lagging.short()),
        Err(e) => warn!("Replica {} could not rejoin: {}", lagging.short(), e),
    }

    let count = dispatcher
        .read(VOLUME, MsgType::StatVolume, Bytes::new())
        .await?;
    info!(
        "Volume {} holds {} entries, replica {} applied op {} of {}",
        VOLUME,
        String::from_utf8_lossy(&count),
        lagging.short(),
        cluster.applied_op_id(lagging, VOLUME),
        group.last_op_id()
    );

    println!("{}", serde_json::to_string_pretty(&group.state_info())?);

    dispatcher.remove_volume(VOLUME).await?;
    info!("Simulation finished");
    Ok(())
}

/// Run `writes` start/commit transactions on blobs of one phase
async fn commit_blobs(dispatcher: &VolumeDispatcher, phase: &str, writes: usize) -> Result<()> {
    for n in 0..writes {
        let blob = format!("{}-{}", phase, n);
        dispatcher
            .start_tx(VOLUME, &blob, Bytes::from(format!("tx-{}=open", blob)))
            .await?;
        dispatcher
            .commit_tx(VOLUME, &blob, Bytes::from(format!("{}={}", blob, n)))
            .await?;
    }
    info!("Phase {}: committed {} transactions", phase, writes);
    Ok(())
}
