//! Sources of node and pod notifications.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{LocalPodDescriptor, Notification, RemoteNodeDescriptor};

pub mod k8s;
pub use k8s::KubeWatchSource;

#[async_trait]
pub trait WatchSource {
    /// Streams node notifications, starting with a full `Resync`.
    /// Returns only when the receiver is gone or the source fails for good.
    async fn watch_nodes(&self, tx: mpsc::Sender<Notification<RemoteNodeDescriptor>>) -> Result<()>;

    /// Streams notifications for pods bound to the local node, starting with
    /// a full `Resync`.
    async fn watch_pods(&self, tx: mpsc::Sender<Notification<LocalPodDescriptor>>) -> Result<()>;
}
