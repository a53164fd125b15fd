//! Hybrid overlay node agent entry point.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

use hybrid_overlay_node::bootstrap::bootstrap;
use hybrid_overlay_node::config::Config;
use hybrid_overlay_node::device::{Device, ExecRunner};
use hybrid_overlay_node::node::NodeFlowReconciler;
use hybrid_overlay_node::pod::PodFlowReconciler;
use hybrid_overlay_node::watch::{KubeWatchSource, WatchSource};
use hybrid_overlay_node::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting hybrid overlay node agent with config: {:?}", cfg);

    // The bridge must be in its baseline state before any reconciler runs.
    let device = Device::new(ExecRunner::new(cfg.command_timeout()));
    let local = bootstrap(&device, &cfg)
        .await
        .context("failed to set up the external bridge")?;
    info!(
        "Local overlay subnet {}, address {}, DR MAC {}",
        local.subnet, local.ip, local.dr_mac
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let source = Arc::new(KubeWatchSource::new(client, cfg.node_name.clone()));

    // Notification queues, one per object kind
    let (node_tx, node_rx) = mpsc::channel(cfg.queue_depth);
    let (pod_tx, pod_rx) = mpsc::channel(cfg.queue_depth);

    // Workers
    let node_worker = Worker::new(NodeFlowReconciler::new(device.clone(), &cfg));
    let pod_worker = Worker::new(PodFlowReconciler::new(device.clone(), &cfg, local.dr_mac));
    let node_worker_handle = tokio::spawn(node_worker.run(node_rx));
    let pod_worker_handle = tokio::spawn(pod_worker.run(pod_rx));

    // Watchers
    let node_source = Arc::clone(&source);
    let node_watch_handle = tokio::spawn(async move {
        if let Err(e) = node_source.watch_nodes(node_tx).await {
            error!("Node watcher failed: {}", e);
        }
    });
    let pod_source = Arc::clone(&source);
    let pod_watch_handle = tokio::spawn(async move {
        if let Err(e) = pod_source.watch_pods(pod_tx).await {
            error!("Pod watcher failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    node_watch_handle.abort();
    pod_watch_handle.abort();
    node_worker_handle.abort();
    pod_worker_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
