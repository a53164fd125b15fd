//! Serialized notification handling.
//!
//! One [`Worker`] runs per object kind. It drains a bounded queue one
//! notification at a time, keeps the current membership of that kind and
//! hands the whole membership to its reconciler after every change. The
//! membership mirrors the cluster, never the bridge.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::converge::ConvergeReport;
use crate::error::Result;
use crate::types::{Keyed, Notification};

#[async_trait]
pub trait Reconciler: Send + Sync {
    type Descriptor: Keyed + Send + Sync + 'static;

    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Converges the device to the rules `members` need.
    async fn converge(&self, members: &[&Self::Descriptor]) -> Result<ConvergeReport>;
}

pub struct Worker<R: Reconciler> {
    reconciler: R,
    members: BTreeMap<String, R::Descriptor>,
    synced: bool,
}

impl<R: Reconciler> Worker<R> {
    pub fn new(reconciler: R) -> Self {
        Self {
            reconciler,
            members: BTreeMap::new(),
            synced: false,
        }
    }

    /// Folds `notification` into the membership. Returns false until the
    /// initial list has arrived, since converging on a partial view would
    /// delete rules for objects not seen yet.
    fn apply(&mut self, notification: Notification<R::Descriptor>) -> bool {
        match notification {
            Notification::Apply(member) => {
                debug!("{} {} applied", self.reconciler.kind(), member.key());
                self.members.insert(member.key().to_string(), member);
            }
            Notification::Delete(key) => {
                debug!("{} {} deleted", self.reconciler.kind(), key);
                self.members.remove(&key);
            }
            Notification::Resync(all) => {
                info!("{} resync with {} objects", self.reconciler.kind(), all.len());
                self.members = all.into_iter().map(|m| (m.key().to_string(), m)).collect();
                self.synced = true;
            }
        }
        self.synced
    }

    /// Handles one notification and runs a convergence pass if the initial
    /// list has been seen.
    pub async fn handle(&mut self, notification: Notification<R::Descriptor>) -> Result<Option<ConvergeReport>> {
        if !self.apply(notification) {
            return Ok(None);
        }
        let members: Vec<_> = self.members.values().collect();
        self.reconciler.converge(&members).await.map(Some)
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<Notification<R::Descriptor>>) {
        let kind = self.reconciler.kind();
        info!("Starting {} worker", kind);

        while let Some(notification) = rx.recv().await {
            match self.handle(notification).await {
                Ok(Some(report)) if report != ConvergeReport::default() => {
                    info!(
                        "{} flows converged: {} cookies deleted, {} rules added",
                        kind, report.deleted, report.added
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to converge {} flows: {}", kind, e);
                }
            }
        }

        info!("{} notification channel closed, shutting down", kind);
    }
}
