use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

// Wire types shared with the provisioning backend. Field names follow its camelCase JSON.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Master,
    Worker,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Master => write!(f, "master"),
            NodeType::Worker => write!(f, "worker"),
        }
    }
}

/// Backend operation currently running against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeLock {
    Create,
    Delete,
    ChangeResources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub vm_id: u32,
    pub name: String,
    pub cores: u16,
    /// MiB
    pub memory: u32,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub storage_pool: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<NodeLock>,
}

impl ClusterNode {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub subnet_mask: u8,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub bridge: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmApp {
    #[serde(default)]
    pub id: String,
    pub chart_name: String,
    #[serde(default)]
    pub chart_version: String,
    pub repository: String,
    pub release_name: String,
    pub namespace: String,
    #[serde(default)]
    pub values: String,
    #[serde(default)]
    pub wait: bool,
}

/// Raw Kubernetes manifest applied to the cluster after provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResource {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    #[default]
    Pending,
    Creating,
    Sync,
    OutOfSync,
    Destroying,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub state: ClusterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<NaiveDateTime>,
}

/// A cluster as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    #[serde(default)]
    pub node: String,
    pub cluster_name: String,
    #[serde(default)]
    pub os_image: Option<String>,
    #[serde(default)]
    pub os_image_storage: Option<String>,
    #[serde(default)]
    pub kube_version: Option<String>,
    #[serde(default)]
    pub ssh_key: KeyPair,
    #[serde(default)]
    pub node_username: String,
    #[serde(default)]
    pub node_password: String,
    #[serde(default)]
    pub helm_apps: Vec<HelmApp>,
    #[serde(default)]
    pub cluster_resources: Vec<ClusterResource>,
    /// GiB
    #[serde(default)]
    pub disk_size: u32,
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub status: ClusterStatus,
}

/// Draft sent to the backend to create a cluster. Also what the backend
/// generates as a default configuration for the wizard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    #[serde(default)]
    pub os_image: String,
    #[serde(default)]
    pub os_image_storage: String,
    #[serde(default)]
    pub kube_version: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub ssh_key: KeyPair,
    #[serde(default)]
    pub node_username: String,
    #[serde(default)]
    pub node_password: String,
    #[serde(default)]
    pub helm_apps: Vec<HelmApp>,
    #[serde(default)]
    pub cluster_resources: Vec<ClusterResource>,
    /// GiB
    #[serde(default)]
    pub disk_size: u32,
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
    #[serde(default)]
    pub network: Network,
}

/// Backend stages run for a provisioning request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionStages {
    pub create_virtual_machines: bool,
    pub setup_virtual_machines: bool,
    pub install_kubernetes: bool,
    pub join_nodes_to_cluster: bool,
    pub install_helm_apps: bool,
    pub install_cluster_resources: bool,
}

impl Default for ProvisionStages {
    fn default() -> Self {
        Self {
            create_virtual_machines: true,
            setup_virtual_machines: true,
            install_kubernetes: true,
            join_nodes_to_cluster: true,
            install_helm_apps: true,
            install_cluster_resources: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub stages: ProvisionStages,
    pub cluster: ClusterRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub date: NaiveDateTime,
    #[serde(default)]
    pub cluster_name: String,
    pub message: String,
    pub level: LogLevel,
}

/// Row of the cluster list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHeader {
    pub name: String,
    pub nodes_count: u16,
    pub cores_sum: u16,
    /// MiB
    pub memory_sum: u32,
    /// GiB
    pub disk_size_sum: u32,
    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    pub cores: u16,
    pub memory: u32,
}

pub fn vm_id_asc(nodes: &mut [ClusterNode]) {
    nodes.sort_by_key(|n| n.vm_id);
}
