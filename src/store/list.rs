use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::clients::Backend;
use crate::error::Result;
use crate::models::cluster::ClusterHeader;
use crate::models::views::{ClusterListSummary, ClusterListView};
use crate::polling::PollingTask;

/// Cluster overview with totals across all clusters.
pub struct ClusterListStore {
    backend: Arc<dyn Backend>,
    clusters: watch::Sender<Arc<Vec<ClusterHeader>>>,
}

impl ClusterListStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (clusters, _) = watch::channel(Arc::new(Vec::new()));
        Self { backend, clusters }
    }

    pub fn clusters(&self) -> Arc<Vec<ClusterHeader>> {
        self.clusters.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<ClusterHeader>>> {
        self.clusters.subscribe()
    }

    pub fn apply(&self, clusters: Vec<ClusterHeader>) {
        debug!(clusters = clusters.len(), "cluster list replaced");
        self.clusters.send_replace(Arc::new(clusters));
    }

    pub async fn refresh(&self) -> Result<()> {
        let clusters = self.backend.get_clusters().await?;
        self.apply(clusters);
        Ok(())
    }

    pub fn summary(&self) -> ClusterListSummary {
        summarize(&self.clusters())
    }

    pub fn view(&self) -> ClusterListView {
        let clusters = self.clusters();
        ClusterListView {
            summary: summarize(&clusters),
            clusters: clusters.as_ref().clone(),
        }
    }

    pub fn spawn_poller(self: &Arc<Self>, cadence: Duration) -> PollingTask {
        let fetch_store = self.clone();
        let apply_store = self.clone();
        PollingTask::spawn(
            "cluster-list",
            cadence,
            move || {
                let store = fetch_store.clone();
                async move { store.backend.get_clusters().await }
            },
            move |clusters| apply_store.apply(clusters),
        )
    }
}

pub fn summarize(clusters: &[ClusterHeader]) -> ClusterListSummary {
    clusters
        .iter()
        .fold(ClusterListSummary::default(), |mut sum, c| {
            sum.clusters += 1;
            sum.nodes += u64::from(c.nodes_count);
            sum.cores += u64::from(c.cores_sum);
            sum.memory += u64::from(c.memory_sum);
            sum.disk_size += u64::from(c.disk_size_sum);
            sum
        })
}
