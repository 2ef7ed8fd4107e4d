pub mod http;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::models::cluster::{
    ClusterHeader, ClusterNode, ClusterRequest, ClusterResource, ClusterTopology, HelmApp,
    LogEntry, NodeResources, ProvisionRequest,
};
use crate::models::status::{AppStatusEntry, KubeStatusEntry, VmStatusEntry};

pub use http::BackendClient;

/// Operations of the provisioning backend this console drives.
///
/// Every method is a suspension point; none of them touch local state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_clusters(&self) -> Result<Vec<ClusterHeader>>;
    async fn get_cluster(&self, name: &str) -> Result<ClusterTopology>;
    async fn get_cluster_nodes(&self, name: &str) -> Result<Vec<ClusterNode>>;
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    async fn get_vm_status(&self, name: &str) -> Result<Vec<VmStatusEntry>>;
    async fn get_kube_status(&self, name: &str) -> Result<Vec<KubeStatusEntry>>;
    async fn get_apps_status(&self, name: &str) -> Result<Vec<AppStatusEntry>>;

    /// Returns the node as accepted by the backend, usually carrying a lock.
    async fn add_node(&self, name: &str, node: &ClusterNode) -> Result<ClusterNode>;
    async fn change_node_resources(
        &self,
        name: &str,
        node_name: &str,
        resources: NodeResources,
    ) -> Result<()>;
    async fn delete_node(&self, name: &str, node_name: &str) -> Result<ClusterNode>;

    /// Returns the id assigned to the app.
    async fn save_helm_app(&self, name: &str, app: &HelmApp) -> Result<String>;
    async fn update_helm_app(&self, name: &str, app: &HelmApp) -> Result<()>;
    async fn install_helm_app(&self, name: &str, id: &str) -> Result<()>;
    async fn uninstall_helm_app(&self, name: &str, id: &str) -> Result<()>;
    async fn delete_helm_app(&self, name: &str, id: &str) -> Result<()>;

    /// Returns the id assigned to the resource.
    async fn save_cluster_resource(
        &self,
        name: &str,
        resource: &ClusterResource,
    ) -> Result<String>;
    async fn update_cluster_resource(
        &self,
        name: &str,
        resource: &ClusterResource,
    ) -> Result<()>;
    async fn install_cluster_resource(&self, name: &str, id: &str) -> Result<()>;
    async fn uninstall_cluster_resource(&self, name: &str, id: &str) -> Result<()>;
    async fn delete_cluster_resource(&self, name: &str, id: &str) -> Result<()>;

    async fn generate_default_cluster(&self) -> Result<ClusterRequest>;
    /// Long running: resolves when the backend finished (or gave up on) the
    /// requested stages.
    async fn create_cluster(&self, request: &ProvisionRequest) -> Result<()>;

    async fn get_task_log(&self, name: &str) -> Result<Vec<LogEntry>>;
    async fn clear_task_log(&self, name: &str) -> Result<()>;
}
