use serde::Serialize;

use super::cluster::{ClusterHeader, ClusterNode, ClusterResource, ClusterState, HelmApp, LogEntry};
use super::status::{AppStatus, KubeStatus, Observed, VmStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeWithStatus {
    #[serde(flatten)]
    pub node: ClusterNode,
    pub full_name: String,
    pub vm_status: Observed<VmStatus>,
    pub kube_status: Observed<KubeStatus>,
    pub can_edit: bool,
    pub can_delete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppWithStatus {
    #[serde(flatten)]
    pub app: HelmApp,
    pub status: Observed<AppStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWithStatus {
    #[serde(flatten)]
    pub resource: ClusterResource,
    pub status: Observed<AppStatus>,
}

/// Everything the cluster management screen renders, computed in one pass
/// from a single store state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub cluster_name: String,
    pub state: ClusterState,
    pub masters: Vec<NodeWithStatus>,
    pub workers: Vec<NodeWithStatus>,
    pub apps: Vec<AppWithStatus>,
    pub resources: Vec<ResourceWithStatus>,
    pub logs: Vec<LogEntry>,
    pub can_add_node: bool,
    pub can_edit_workloads: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListSummary {
    pub clusters: usize,
    pub nodes: u64,
    pub cores: u64,
    /// MiB
    pub memory: u64,
    /// GiB
    pub disk_size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListView {
    pub summary: ClusterListSummary,
    pub clusters: Vec<ClusterHeader>,
}
