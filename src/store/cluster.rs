//! Per-cluster management store.
//!
//! The store keeps one immutable [`StoreState`] behind a watch channel. Every
//! change builds a new state and swaps it in whole, so readers always see a
//! topology and snapshots that belong together. Status joins are computed
//! from a state on demand and never stored.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::allocator::{self, BlockStep};
use crate::clients::Backend;
use crate::config::PollingConfig;
use crate::error::{Error, Result};
use crate::models::cluster::{
    ClusterNode, ClusterResource, ClusterState, ClusterTopology, HelmApp, LogEntry, NodeLock,
    NodeResources, NodeType, vm_id_asc,
};
use crate::models::status::{AppStatus, KubeStatus, StatusSnapshot, VmStatus};
use crate::models::views::{AppWithStatus, ClusterView, NodeWithStatus, ResourceWithStatus};
use crate::polling::PollingTask;
use crate::validation;

pub type VmSnapshot = StatusSnapshot<u32, VmStatus>;
pub type KubeSnapshot = StatusSnapshot<String, KubeStatus>;
pub type AppSnapshot = StatusSnapshot<String, AppStatus>;

#[derive(Debug, Clone, Default)]
pub struct StoreState {
    /// Bumped on every topology load.
    pub generation: u64,
    pub topology: Option<ClusterTopology>,
    pub vm_status: VmSnapshot,
    pub kube_status: KubeSnapshot,
    pub app_status: AppSnapshot,
    pub logs: Vec<LogEntry>,
}

/// Kube status is reported per `<cluster>-<node>`.
pub fn kube_node_name(cluster_name: &str, node_name: &str) -> String {
    format!("{}-{}", cluster_name, node_name)
}

impl StoreState {
    pub fn cluster_name(&self) -> Option<&str> {
        self.topology.as_ref().map(|t| t.cluster_name.as_str())
    }

    pub fn cluster_state(&self) -> Option<ClusterState> {
        self.topology.as_ref().map(|t| t.status.state)
    }

    fn synced(&self) -> bool {
        self.cluster_state() == Some(ClusterState::Sync)
    }

    fn nodes(&self) -> &[ClusterNode] {
        self.topology.as_ref().map(|t| t.nodes.as_slice()).unwrap_or_default()
    }

    pub fn any_node_locked(&self) -> bool {
        self.nodes().iter().any(ClusterNode::is_locked)
    }

    pub fn node_blocked(&self, node: &ClusterNode) -> bool {
        node.is_locked() || !self.synced()
    }

    pub fn can_delete_node(&self, node: &ClusterNode) -> bool {
        let unlocked = self.nodes().iter().filter(|n| !n.is_locked()).count();
        !self.node_blocked(node) && unlocked >= 2
    }

    pub fn can_add_node(&self) -> bool {
        self.synced() && !self.any_node_locked()
    }

    pub fn can_edit_workloads(&self) -> bool {
        self.synced() && !self.any_node_locked()
    }

    pub fn nodes_with_status(&self, role: NodeType) -> Vec<NodeWithStatus> {
        let Some(topology) = &self.topology else {
            return Vec::new();
        };
        topology
            .nodes
            .iter()
            .filter(|n| n.node_type == role)
            .map(|node| {
                let full_name = kube_node_name(&topology.cluster_name, &node.name);
                NodeWithStatus {
                    vm_status: self.vm_status.lookup(&node.vm_id),
                    kube_status: self.kube_status.lookup(full_name.as_str()),
                    can_edit: !self.node_blocked(node),
                    can_delete: self.can_delete_node(node),
                    full_name,
                    node: node.clone(),
                }
            })
            .collect()
    }

    pub fn apps_with_status(&self) -> Vec<AppWithStatus> {
        let Some(topology) = &self.topology else {
            return Vec::new();
        };
        topology
            .helm_apps
            .iter()
            .map(|app| AppWithStatus {
                status: self.app_status.lookup(app.id.as_str()),
                app: app.clone(),
            })
            .collect()
    }

    pub fn resources_with_status(&self) -> Vec<ResourceWithStatus> {
        let Some(topology) = &self.topology else {
            return Vec::new();
        };
        topology
            .cluster_resources
            .iter()
            .map(|resource| ResourceWithStatus {
                status: self.app_status.lookup(resource.id.as_str()),
                resource: resource.clone(),
            })
            .collect()
    }

    pub fn view(&self) -> Option<ClusterView> {
        let topology = self.topology.as_ref()?;
        Some(ClusterView {
            cluster_name: topology.cluster_name.clone(),
            state: topology.status.state,
            masters: self.nodes_with_status(NodeType::Master),
            workers: self.nodes_with_status(NodeType::Worker),
            apps: self.apps_with_status(),
            resources: self.resources_with_status(),
            logs: self.logs.clone(),
            can_add_node: self.can_add_node(),
            can_edit_workloads: self.can_edit_workloads(),
        })
    }
}

/// A poll result tagged with the topology generation it was fetched for.
#[derive(Debug)]
pub struct Fetched<T> {
    pub generation: u64,
    pub value: T,
}

pub struct ClusterStore {
    backend: Arc<dyn Backend>,
    state: watch::Sender<Arc<StoreState>>,
}

impl ClusterStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (state, _) = watch::channel(Arc::new(StoreState::default()));
        Self { backend, state }
    }

    pub fn snapshot(&self) -> Arc<StoreState> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreState>> {
        self.state.subscribe()
    }

    pub fn view(&self) -> Option<ClusterView> {
        self.snapshot().view()
    }

    fn target(&self) -> Option<(String, u64)> {
        let state = self.state.borrow();
        let name = state.cluster_name()?.to_string();
        Some((name, state.generation))
    }

    fn cluster_name(&self) -> Result<String> {
        self.target().map(|(name, _)| name).ok_or(Error::NoTopology)
    }

    fn mutate_topology(&self, f: impl FnOnce(&mut ClusterTopology)) {
        self.state.send_if_modified(|cur| {
            let mut next = StoreState::clone(cur);
            let Some(topology) = next.topology.as_mut() else {
                return false;
            };
            f(topology);
            *cur = Arc::new(next);
            true
        });
    }

    fn apply_if_current<T>(
        &self,
        facet: &'static str,
        fetched: Option<Fetched<T>>,
        f: impl FnOnce(&mut StoreState, T),
    ) -> bool {
        let Some(Fetched { generation, value }) = fetched else {
            return false;
        };
        self.state.send_if_modified(|cur| {
            if cur.generation != generation {
                warn!(
                    facet,
                    fetched = generation,
                    current = cur.generation,
                    "dropping result fetched for a previous topology"
                );
                return false;
            }
            let mut next = StoreState::clone(cur);
            f(&mut next, value);
            *cur = Arc::new(next);
            true
        })
    }

    /// Replace the topology. Every status snapshot starts over as unknown.
    pub async fn load_topology(&self, cluster_name: &str) -> Result<()> {
        let mut topology = self.backend.get_cluster(cluster_name).await?;
        vm_id_asc(&mut topology.nodes);
        let nodes = topology.nodes.len();
        self.state.send_modify(|cur| {
            *cur = Arc::new(StoreState {
                generation: cur.generation + 1,
                topology: Some(topology),
                ..Default::default()
            });
        });
        info!(cluster = cluster_name, nodes, "topology loaded");
        Ok(())
    }

    pub async fn fetch_vm_status(&self) -> Result<Option<Fetched<VmSnapshot>>> {
        let Some((name, generation)) = self.target() else {
            return Ok(None);
        };
        let entries = self.backend.get_vm_status(&name).await?;
        Ok(Some(Fetched {
            generation,
            value: entries.into(),
        }))
    }

    pub fn apply_vm_status(&self, fetched: Option<Fetched<VmSnapshot>>) {
        let entries = fetched.as_ref().map(|f| f.value.len());
        if self.apply_if_current("vm", fetched, |s, v| s.vm_status = v) {
            debug!(facet = "vm", entries, "snapshot replaced");
        }
    }

    pub async fn refresh_vm_status(&self) -> Result<()> {
        let fetched = self.fetch_vm_status().await?;
        self.apply_vm_status(fetched);
        Ok(())
    }

    pub async fn fetch_kube_status(&self) -> Result<Option<Fetched<KubeSnapshot>>> {
        let Some((name, generation)) = self.target() else {
            return Ok(None);
        };
        let entries = self.backend.get_kube_status(&name).await?;
        Ok(Some(Fetched {
            generation,
            value: entries.into(),
        }))
    }

    pub fn apply_kube_status(&self, fetched: Option<Fetched<KubeSnapshot>>) {
        let entries = fetched.as_ref().map(|f| f.value.len());
        if self.apply_if_current("kube", fetched, |s, v| s.kube_status = v) {
            debug!(facet = "kube", entries, "snapshot replaced");
        }
    }

    pub async fn refresh_kube_status(&self) -> Result<()> {
        let fetched = self.fetch_kube_status().await?;
        self.apply_kube_status(fetched);
        Ok(())
    }

    pub async fn fetch_app_status(&self) -> Result<Option<Fetched<AppSnapshot>>> {
        let Some((name, generation)) = self.target() else {
            return Ok(None);
        };
        let entries = self.backend.get_apps_status(&name).await?;
        Ok(Some(Fetched {
            generation,
            value: entries.into(),
        }))
    }

    pub fn apply_app_status(&self, fetched: Option<Fetched<AppSnapshot>>) {
        let entries = fetched.as_ref().map(|f| f.value.len());
        if self.apply_if_current("apps", fetched, |s, v| s.app_status = v) {
            debug!(facet = "apps", entries, "snapshot replaced");
        }
    }

    pub async fn refresh_app_status(&self) -> Result<()> {
        let fetched = self.fetch_app_status().await?;
        self.apply_app_status(fetched);
        Ok(())
    }

    pub async fn fetch_logs(&self) -> Result<Option<Fetched<Vec<LogEntry>>>> {
        let Some((name, generation)) = self.target() else {
            return Ok(None);
        };
        let value = self.backend.get_task_log(&name).await?;
        Ok(Some(Fetched { generation, value }))
    }

    pub fn apply_logs(&self, fetched: Option<Fetched<Vec<LogEntry>>>) {
        let entries = fetched.as_ref().map(|f| f.value.len());
        if self.apply_if_current("logs", fetched, |s, v| s.logs = v) {
            debug!(facet = "logs", entries, "snapshot replaced");
        }
    }

    pub async fn refresh_logs(&self) -> Result<()> {
        let fetched = self.fetch_logs().await?;
        self.apply_logs(fetched);
        Ok(())
    }

    /// No request is made unless some node carries a lock.
    pub async fn fetch_locked_nodes(&self) -> Result<Option<Fetched<Vec<ClusterNode>>>> {
        if !self.snapshot().any_node_locked() {
            return Ok(None);
        }
        let Some((name, generation)) = self.target() else {
            return Ok(None);
        };
        let mut value = self.backend.get_cluster_nodes(&name).await?;
        vm_id_asc(&mut value);
        Ok(Some(Fetched { generation, value }))
    }

    pub fn apply_locked_nodes(&self, fetched: Option<Fetched<Vec<ClusterNode>>>) {
        let applied = self.apply_if_current("nodes", fetched, |s, nodes| {
            if let Some(topology) = s.topology.as_mut() {
                topology.nodes = nodes;
            }
        });
        if applied {
            debug!(facet = "nodes", "node list replaced");
        }
    }

    /// Returns whether the node list was re-fetched.
    pub async fn refresh_locked_nodes_if_any(&self) -> Result<bool> {
        let fetched = self.fetch_locked_nodes().await?;
        let fetched_any = fetched.is_some();
        self.apply_locked_nodes(fetched);
        Ok(fetched_any)
    }

    pub fn propose_node(
        &self,
        role: NodeType,
        default_master: &ClusterNode,
        step: BlockStep,
    ) -> Result<ClusterNode> {
        let state = self.snapshot();
        let topology = state.topology.as_ref().ok_or(Error::NoTopology)?;
        Ok(allocator::propose_node(&topology.nodes, role, default_master, step))
    }

    fn node(&self, node_name: &str) -> Result<(Arc<StoreState>, ClusterNode)> {
        let state = self.snapshot();
        let node = state
            .nodes()
            .iter()
            .find(|n| n.name == node_name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {}", node_name)))?;
        Ok((state, node))
    }

    fn ensure_node_editable(state: &StoreState, node: &ClusterNode) -> Result<()> {
        if node.is_locked() {
            return Err(Error::node_locked(&node.name));
        }
        if !state.synced() {
            return Err(Error::cluster_busy("cluster is not in sync"));
        }
        Ok(())
    }

    fn ensure_workloads_editable(&self) -> Result<Arc<StoreState>> {
        let state = self.snapshot();
        if state.topology.is_none() {
            return Err(Error::NoTopology);
        }
        if !state.can_edit_workloads() {
            return Err(Error::cluster_busy(
                "cluster must be in sync with no node operation running",
            ));
        }
        Ok(state)
    }

    /// Insert the node locally, then ask the backend to create it. The
    /// backend's copy (usually carrying a create lock) replaces ours.
    pub async fn add_node(&self, node: ClusterNode) -> Result<ClusterNode> {
        let state = self.snapshot();
        if state.topology.is_none() {
            return Err(Error::NoTopology);
        }
        if !state.can_add_node() {
            return Err(Error::cluster_busy(
                "cluster must be in sync with no node operation running",
            ));
        }
        validation::validate_node(&node, state.nodes()).into_result()?;
        let name = self.cluster_name()?;

        let local = node.clone();
        self.mutate_topology(|t| {
            t.nodes.push(local);
            vm_id_asc(&mut t.nodes);
        });

        let created = self.backend.add_node(&name, &node).await?;
        let accepted = created.clone();
        self.mutate_topology(|t| {
            if let Some(slot) = t.nodes.iter_mut().find(|n| n.vm_id == node.vm_id) {
                *slot = accepted;
            }
            vm_id_asc(&mut t.nodes);
        });
        info!(cluster = %name, node = %created.name, vm_id = created.vm_id, "node added");
        Ok(created)
    }

    pub async fn change_node_resources(
        &self,
        node_name: &str,
        resources: NodeResources,
    ) -> Result<()> {
        let (state, node) = self.node(node_name)?;
        Self::ensure_node_editable(&state, &node)?;

        let mut errors = crate::error::ValidationErrors::default();
        if resources.cores < 1 {
            errors.push("cores", "must be at least 1");
        }
        if resources.memory == 0 {
            errors.push("memory", "must be greater than 0");
        }
        errors.into_result()?;
        let name = self.cluster_name()?;

        self.mutate_topology(|t| {
            if let Some(n) = t.nodes.iter_mut().find(|n| n.name == node_name) {
                n.cores = resources.cores;
                n.memory = resources.memory;
            }
        });
        self.backend
            .change_node_resources(&name, node_name, resources)
            .await
    }

    /// Marks the node for deletion locally, then replaces it with the
    /// backend's copy.
    pub async fn delete_node(&self, node_name: &str) -> Result<ClusterNode> {
        let (state, node) = self.node(node_name)?;
        Self::ensure_node_editable(&state, &node)?;
        if !state.can_delete_node(&node) {
            return Err(Error::cluster_busy(
                "at least one other unlocked node must remain",
            ));
        }
        let name = self.cluster_name()?;

        self.mutate_topology(|t| {
            if let Some(n) = t.nodes.iter_mut().find(|n| n.name == node_name) {
                n.lock = Some(NodeLock::Delete);
            }
        });

        let deleted = self.backend.delete_node(&name, node_name).await?;
        let accepted = deleted.clone();
        self.mutate_topology(|t| {
            if let Some(slot) = t.nodes.iter_mut().find(|n| n.name == node_name) {
                *slot = accepted;
            }
        });
        info!(cluster = %name, node = node_name, "node deletion requested");
        Ok(deleted)
    }

    pub async fn add_helm_app(&self, mut app: HelmApp) -> Result<String> {
        let state = self.ensure_workloads_editable()?;
        let existing = state
            .topology
            .as_ref()
            .map(|t| t.helm_apps.as_slice())
            .unwrap_or_default();
        validation::validate_helm_app(&app, existing).into_result()?;
        let name = self.cluster_name()?;

        app.id.clear();
        let local = app.clone();
        self.mutate_topology(|t| t.helm_apps.push(local));

        let id = self.backend.save_helm_app(&name, &app).await?;
        let assigned = id.clone();
        self.mutate_topology(|t| {
            if let Some(a) = t
                .helm_apps
                .iter_mut()
                .find(|a| a.id.is_empty() && a.release_name == app.release_name)
            {
                a.id = assigned;
            }
        });
        Ok(id)
    }

    pub async fn update_helm_app(&self, app: HelmApp) -> Result<()> {
        let state = self.ensure_workloads_editable()?;
        let apps = state
            .topology
            .as_ref()
            .map(|t| t.helm_apps.as_slice())
            .unwrap_or_default();
        if !apps.iter().any(|a| a.id == app.id) {
            return Err(Error::not_found(format!("helm app {}", app.id)));
        }
        let others: Vec<HelmApp> = apps.iter().filter(|a| a.id != app.id).cloned().collect();
        validation::validate_helm_app(&app, &others).into_result()?;
        let name = self.cluster_name()?;

        let local = app.clone();
        self.mutate_topology(|t| {
            if let Some(slot) = t.helm_apps.iter_mut().find(|a| a.id == local.id) {
                *slot = local;
            }
        });
        self.backend.update_helm_app(&name, &app).await
    }

    pub async fn delete_helm_app(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.mutate_topology(|t| t.helm_apps.retain(|a| a.id != id));
        self.backend.delete_helm_app(&name, id).await
    }

    pub async fn install_helm_app(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.backend.install_helm_app(&name, id).await?;
        self.refresh_app_status_after_write().await;
        Ok(())
    }

    pub async fn uninstall_helm_app(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.backend.uninstall_helm_app(&name, id).await?;
        self.refresh_app_status_after_write().await;
        Ok(())
    }

    pub async fn add_cluster_resource(&self, mut resource: ClusterResource) -> Result<String> {
        let state = self.ensure_workloads_editable()?;
        let existing = state
            .topology
            .as_ref()
            .map(|t| t.cluster_resources.as_slice())
            .unwrap_or_default();
        validation::validate_resource(&resource, existing).into_result()?;
        let name = self.cluster_name()?;

        resource.id.clear();
        let local = resource.clone();
        self.mutate_topology(|t| t.cluster_resources.push(local));

        let id = self.backend.save_cluster_resource(&name, &resource).await?;
        let assigned = id.clone();
        self.mutate_topology(|t| {
            if let Some(r) = t
                .cluster_resources
                .iter_mut()
                .find(|r| r.id.is_empty() && r.name == resource.name)
            {
                r.id = assigned;
            }
        });
        Ok(id)
    }

    pub async fn update_cluster_resource(&self, resource: ClusterResource) -> Result<()> {
        let state = self.ensure_workloads_editable()?;
        let resources = state
            .topology
            .as_ref()
            .map(|t| t.cluster_resources.as_slice())
            .unwrap_or_default();
        if !resources.iter().any(|r| r.id == resource.id) {
            return Err(Error::not_found(format!("cluster resource {}", resource.id)));
        }
        let others: Vec<ClusterResource> = resources
            .iter()
            .filter(|r| r.id != resource.id)
            .cloned()
            .collect();
        validation::validate_resource(&resource, &others).into_result()?;
        let name = self.cluster_name()?;

        let local = resource.clone();
        self.mutate_topology(|t| {
            if let Some(slot) = t.cluster_resources.iter_mut().find(|r| r.id == local.id) {
                *slot = local;
            }
        });
        self.backend.update_cluster_resource(&name, &resource).await
    }

    pub async fn delete_cluster_resource(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.mutate_topology(|t| t.cluster_resources.retain(|r| r.id != id));
        self.backend.delete_cluster_resource(&name, id).await
    }

    pub async fn install_cluster_resource(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.backend.install_cluster_resource(&name, id).await?;
        self.refresh_app_status_after_write().await;
        Ok(())
    }

    pub async fn uninstall_cluster_resource(&self, id: &str) -> Result<()> {
        self.ensure_workloads_editable()?;
        let name = self.cluster_name()?;
        self.backend.uninstall_cluster_resource(&name, id).await?;
        self.refresh_app_status_after_write().await;
        Ok(())
    }

    async fn refresh_app_status_after_write(&self) {
        if let Err(e) = self.refresh_app_status().await {
            warn!(error = %e, "app status refresh after write failed");
        }
    }

    /// `confirm_name` is the name the user typed to confirm.
    pub async fn delete_cluster(&self, confirm_name: &str) -> Result<()> {
        let state = self.snapshot();
        let topology = state.topology.as_ref().ok_or(Error::NoTopology)?;
        if topology.cluster_name != confirm_name {
            return Err(Error::validation(
                "clusterName",
                "confirmation does not match the cluster name",
            ));
        }
        if matches!(
            topology.status.state,
            ClusterState::Creating | ClusterState::Destroying
        ) {
            return Err(Error::cluster_busy(format!(
                "cluster {} is {:?}",
                topology.cluster_name, topology.status.state
            )));
        }

        self.backend.delete_cluster(&topology.cluster_name).await?;
        self.mutate_topology(|t| t.status.state = ClusterState::Destroying);
        info!(cluster = %topology.cluster_name, "cluster deletion requested");
        Ok(())
    }

    /// Load the cluster and start its pollers. Dropping the returned mount
    /// stops them.
    pub async fn mount(
        backend: Arc<dyn Backend>,
        cluster_name: &str,
        polling: &PollingConfig,
    ) -> Result<ClusterMount> {
        let store = Arc::new(ClusterStore::new(backend));
        store.load_topology(cluster_name).await?;

        let (vm, kube, apps, logs, locks) = tokio::join!(
            store.refresh_vm_status(),
            store.refresh_kube_status(),
            store.refresh_app_status(),
            store.refresh_logs(),
            store.refresh_locked_nodes_if_any(),
        );
        for (facet, result) in [("vm", vm), ("kube", kube), ("apps", apps), ("logs", logs)] {
            if let Err(e) = result {
                warn!(cluster = cluster_name, facet, error = %e, "initial status read failed");
            }
        }
        match locks {
            Ok(true) => debug!(cluster = cluster_name, "locked nodes re-read on mount"),
            Ok(false) => {}
            Err(e) => warn!(cluster = cluster_name, facet = "nodes", error = %e, "initial status read failed"),
        }

        let status = polling.status_interval();
        let tasks = vec![
            spawn_facet(
                &store,
                "vm-status",
                status,
                |s| async move { s.fetch_vm_status().await },
                ClusterStore::apply_vm_status,
            ),
            spawn_facet(
                &store,
                "kube-status",
                status,
                |s| async move { s.fetch_kube_status().await },
                ClusterStore::apply_kube_status,
            ),
            spawn_facet(
                &store,
                "app-status",
                status,
                |s| async move { s.fetch_app_status().await },
                ClusterStore::apply_app_status,
            ),
            spawn_facet(
                &store,
                "node-locks",
                status,
                |s| async move { s.fetch_locked_nodes().await },
                ClusterStore::apply_locked_nodes,
            ),
            spawn_facet(
                &store,
                "action-log",
                polling.logs_interval(),
                |s| async move { s.fetch_logs().await },
                ClusterStore::apply_logs,
            ),
        ];

        Ok(ClusterMount { store, tasks })
    }
}

fn spawn_facet<T, Fut>(
    store: &Arc<ClusterStore>,
    name: &'static str,
    cadence: Duration,
    fetch: impl Fn(Arc<ClusterStore>) -> Fut + Send + Sync + 'static,
    apply: impl Fn(&ClusterStore, Option<Fetched<T>>) + Send + Sync + 'static,
) -> PollingTask
where
    T: Send + 'static,
    Fut: Future<Output = Result<Option<Fetched<T>>>> + Send + 'static,
{
    let fetch_store = store.clone();
    let apply_store = store.clone();
    PollingTask::spawn(
        name,
        cadence,
        move || fetch(fetch_store.clone()),
        move |fetched| apply(&apply_store, fetched),
    )
}

/// A store with its pollers running.
pub struct ClusterMount {
    store: Arc<ClusterStore>,
    tasks: Vec<PollingTask>,
}

impl ClusterMount {
    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PollingTask::name).collect()
    }
}

impl Drop for ClusterMount {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.stop();
        }
        if let Some(name) = self.store.snapshot().cluster_name() {
            debug!(cluster = name, tasks = ?self.task_names(), "cluster view unmounted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockBackend;
    use crate::models::cluster::ClusterStatus;
    use crate::models::status::{
        AppStatusEntry, KubeStatusEntry, Observed, VmStatusEntry,
    };

    fn node(vm_id: u32, name: &str, node_type: NodeType, lock: Option<NodeLock>) -> ClusterNode {
        ClusterNode {
            vm_id,
            name: name.to_string(),
            cores: 2,
            memory: 2048,
            ip_address: format!("10.0.0.{}", vm_id - 90),
            storage_pool: "local-lvm".to_string(),
            node_type,
            lock,
        }
    }

    fn topology(nodes: Vec<ClusterNode>) -> ClusterTopology {
        ClusterTopology {
            cluster_name: "c1".to_string(),
            nodes,
            helm_apps: vec![HelmApp {
                id: "app-1".into(),
                chart_name: "ingress-nginx".into(),
                repository: "https://kubernetes.github.io/ingress-nginx".into(),
                release_name: "ingress".into(),
                namespace: "ingress".into(),
                ..Default::default()
            }],
            status: ClusterStatus {
                state: ClusterState::Sync,
                last_update: None,
            },
            ..Default::default()
        }
    }

    fn healthy() -> ClusterTopology {
        topology(vec![
            node(105, "worker-1", NodeType::Worker, None),
            node(100, "master-1", NodeType::Master, None),
        ])
    }

    fn backend_error() -> Error {
        Error::Backend {
            method: "DELETE",
            path: "/api/v1/clusters/c1/apps/app-1".into(),
            status: 500,
            body: "boom".into(),
        }
    }

    async fn loaded(mock: MockBackend) -> ClusterStore {
        let store = ClusterStore::new(Arc::new(mock));
        store.load_topology("c1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn statuses_are_unknown_after_load_until_refreshed() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster()
            .times(2)
            .returning(|_| Ok(healthy()));
        mock.expect_get_vm_status().times(1).returning(|_| {
            Ok(vec![
                VmStatusEntry { vmid: 100, status: VmStatus::Running },
                VmStatusEntry { vmid: 105, status: VmStatus::Stopped },
            ])
        });
        let store = loaded(mock).await;

        let masters = store.snapshot().nodes_with_status(NodeType::Master);
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].vm_status, Observed::Unknown);
        assert_eq!(masters[0].kube_status, Observed::Unknown);

        store.refresh_vm_status().await.unwrap();
        let masters = store.snapshot().nodes_with_status(NodeType::Master);
        assert_eq!(masters[0].vm_status, Observed::Known(VmStatus::Running));
        assert_eq!(masters[0].kube_status, Observed::Unknown);

        store.load_topology("c1").await.unwrap();
        let workers = store.snapshot().nodes_with_status(NodeType::Worker);
        assert_eq!(workers[0].vm_status, Observed::Unknown);
    }

    #[tokio::test]
    async fn nodes_are_sorted_and_kube_status_joined_by_full_name() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_get_kube_status().returning(|_| {
            Ok(vec![KubeStatusEntry {
                name: "c1-worker-1".into(),
                status: KubeStatus::Ready,
            }])
        });
        let store = loaded(mock).await;
        store.refresh_kube_status().await.unwrap();

        let state = store.snapshot();
        let ids: Vec<u32> = state.topology.as_ref().unwrap().nodes.iter().map(|n| n.vm_id).collect();
        assert_eq!(ids, vec![100, 105]);

        let workers = store.snapshot().nodes_with_status(NodeType::Worker);
        assert_eq!(workers[0].full_name, "c1-worker-1");
        assert_eq!(workers[0].kube_status, Observed::Known(KubeStatus::Ready));
        let masters = store.snapshot().nodes_with_status(NodeType::Master);
        assert_eq!(masters[0].kube_status, Observed::Unknown);
    }

    #[tokio::test]
    async fn refresh_without_topology_is_a_noop() {
        let store = ClusterStore::new(Arc::new(MockBackend::new()));
        store.refresh_vm_status().await.unwrap();
        store.refresh_app_status().await.unwrap();
        assert!(!store.refresh_locked_nodes_if_any().await.unwrap());
        assert!(store.view().is_none());
    }

    #[tokio::test]
    async fn result_fetched_before_a_reload_is_dropped() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_get_vm_status().returning(|_| {
            Ok(vec![VmStatusEntry { vmid: 100, status: VmStatus::Running }])
        });
        let store = loaded(mock).await;

        let fetched = store.fetch_vm_status().await.unwrap();
        store.load_topology("c1").await.unwrap();
        store.apply_vm_status(fetched);

        assert_eq!(store.snapshot().vm_status.lookup(&100), Observed::Unknown);
    }

    #[tokio::test]
    async fn locked_node_refuses_edit_and_delete() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| {
            Ok(topology(vec![
                node(100, "master-1", NodeType::Master, None),
                node(105, "worker-1", NodeType::Worker, Some(NodeLock::ChangeResources)),
                node(106, "worker-2", NodeType::Worker, None),
            ]))
        });
        let store = loaded(mock).await;

        let err = store.delete_node("worker-1").await.unwrap_err();
        assert!(matches!(err, Error::NodeLocked(ref n) if n == "worker-1"));

        let err = store
            .change_node_resources("worker-1", NodeResources { cores: 4, memory: 4096 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeLocked(_)));

        let state = store.snapshot();
        assert!(!state.can_add_node());
        assert!(!state.can_edit_workloads());
        let workers = state.nodes_with_status(NodeType::Worker);
        assert!(!workers[0].can_edit);
        assert!(!workers[0].can_delete);
        assert!(workers[1].can_edit);
    }

    #[tokio::test]
    async fn lock_refresh_only_calls_backend_while_a_node_is_locked() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| {
            Ok(topology(vec![
                node(100, "master-1", NodeType::Master, None),
                node(105, "worker-1", NodeType::Worker, Some(NodeLock::Create)),
            ]))
        });
        mock.expect_get_cluster_nodes().times(1).returning(|_| {
            Ok(vec![
                node(105, "worker-1", NodeType::Worker, None),
                node(100, "master-1", NodeType::Master, None),
            ])
        });
        let store = loaded(mock).await;

        assert!(store.refresh_locked_nodes_if_any().await.unwrap());
        assert!(!store.snapshot().any_node_locked());
        assert!(!store.refresh_locked_nodes_if_any().await.unwrap());
        assert!(!store.refresh_locked_nodes_if_any().await.unwrap());
    }

    #[tokio::test]
    async fn cluster_out_of_sync_blocks_every_node() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| {
            let mut t = healthy();
            t.status.state = ClusterState::OutOfSync;
            Ok(t)
        });
        let store = loaded(mock).await;

        let err = store.delete_node("worker-1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterBusy(_)));
        let proposal = store
            .propose_node(NodeType::Worker, &node(999, "master-1", NodeType::Master, None), BlockStep(5))
            .unwrap();
        let err = store.add_node(proposal).await.unwrap_err();
        assert!(matches!(err, Error::ClusterBusy(_)));
    }

    #[tokio::test]
    async fn last_unlocked_node_cannot_be_deleted() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| {
            Ok(topology(vec![node(100, "master-1", NodeType::Master, None)]))
        });
        let store = loaded(mock).await;
        let err = store.delete_node("master-1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterBusy(_)));
    }

    #[tokio::test]
    async fn added_node_is_replaced_by_the_backend_copy() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_add_node().times(1).returning(|_, n| {
            let mut created = n.clone();
            created.lock = Some(NodeLock::Create);
            Ok(created)
        });
        let store = loaded(mock).await;

        let template = node(999, "master-1", NodeType::Master, None);
        let proposal = store
            .propose_node(NodeType::Worker, &template, BlockStep(5))
            .unwrap();
        assert_eq!(proposal.vm_id, 106);
        assert_eq!(proposal.name, "worker-2");

        let created = store.add_node(proposal).await.unwrap();
        assert_eq!(created.lock, Some(NodeLock::Create));

        let state = store.snapshot();
        let nodes = &state.topology.as_ref().unwrap().nodes;
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].vm_id, 106);
        assert_eq!(nodes[2].lock, Some(NodeLock::Create));
        assert!(!state.can_add_node());
    }

    #[tokio::test]
    async fn colliding_node_is_rejected_before_any_call() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        let store = loaded(mock).await;

        let dup = node(105, "worker-1", NodeType::Worker, None);
        let err = store.add_node(dup).await.unwrap_err();
        match err {
            Error::Validation(errors) => {
                assert!(errors.has("name"));
                assert!(errors.has("vmId"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn delete_node_marks_the_lock_then_takes_backend_copy() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_delete_node().times(1).returning(|_, name| {
            let mut n = node(105, name, NodeType::Worker, None);
            n.lock = Some(NodeLock::Delete);
            Ok(n)
        });
        let store = loaded(mock).await;

        store.delete_node("worker-1").await.unwrap();
        let workers = store.snapshot().nodes_with_status(NodeType::Worker);
        assert_eq!(workers[0].node.lock, Some(NodeLock::Delete));
    }

    #[tokio::test]
    async fn failed_write_keeps_the_optimistic_change() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_delete_helm_app()
            .times(1)
            .returning(|_, _| Err(backend_error()));
        let store = loaded(mock).await;

        let err = store.delete_helm_app("app-1").await.unwrap_err();
        assert!(matches!(err, Error::Backend { status: 500, .. }));
        assert!(store.snapshot().apps_with_status().is_empty());
    }

    #[tokio::test]
    async fn saved_app_gets_the_backend_id_and_status_after_install() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_save_helm_app()
            .times(1)
            .returning(|_, _| Ok("app-2".to_string()));
        mock.expect_install_helm_app().times(1).returning(|_, _| Ok(()));
        mock.expect_get_apps_status().times(1).returning(|_| {
            Ok(vec![AppStatusEntry {
                id: "app-2".into(),
                status: AppStatus::Deployed,
            }])
        });
        let store = loaded(mock).await;

        let id = store
            .add_helm_app(HelmApp {
                chart_name: "cert-manager".into(),
                repository: "https://charts.jetstack.io".into(),
                release_name: "cert-manager".into(),
                namespace: "cert-manager".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id, "app-2");

        store.install_helm_app(&id).await.unwrap();
        let apps = store.snapshot().apps_with_status();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].status, Observed::Unknown);
        assert_eq!(apps[1].app.id, "app-2");
        assert_eq!(apps[1].status, Observed::Known(AppStatus::Deployed));
    }

    #[tokio::test]
    async fn delete_cluster_needs_the_typed_name() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_delete_cluster().times(1).returning(|_| Ok(()));
        let store = loaded(mock).await;

        let err = store.delete_cluster("c2").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        store.delete_cluster("c1").await.unwrap();
        assert_eq!(store.snapshot().cluster_state(), Some(ClusterState::Destroying));

        let err = store.delete_cluster("c1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterBusy(_)));
    }

    #[tokio::test]
    async fn view_splits_roles_and_exposes_gates() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        let store = loaded(mock).await;

        let view = store.view().unwrap();
        assert_eq!(view.cluster_name, "c1");
        assert_eq!(view.masters.len(), 1);
        assert_eq!(view.workers.len(), 1);
        assert_eq!(view.apps.len(), 1);
        assert!(view.can_add_node);
        assert!(view.can_edit_workloads);
        assert!(view.workers[0].can_delete);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_polls_until_dropped() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().returning(|_| Ok(healthy()));
        mock.expect_get_vm_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_kube_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_apps_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_task_log().returning(|_| Ok(Vec::new()));

        let mount = ClusterStore::mount(Arc::new(mock), "c1", &PollingConfig::default())
            .await
            .unwrap();
        assert_eq!(
            mount.task_names(),
            vec!["vm-status", "kube-status", "app-status", "node-locks", "action-log"]
        );

        let mut changes = mount.store().subscribe();
        changes.borrow_and_update();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(changes.has_changed().unwrap());
        drop(mount);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_rereads_nodes_when_one_is_locked() {
        let mut mock = MockBackend::new();
        mock.expect_get_cluster().times(1).returning(|_| {
            Ok(topology(vec![
                node(100, "master-1", NodeType::Master, None),
                node(105, "worker-1", NodeType::Worker, Some(NodeLock::Create)),
            ]))
        });
        mock.expect_get_cluster_nodes().times(1).returning(|_| {
            Ok(vec![
                node(100, "master-1", NodeType::Master, None),
                node(105, "worker-1", NodeType::Worker, None),
            ])
        });
        mock.expect_get_vm_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_kube_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_apps_status().returning(|_| Ok(Vec::new()));
        mock.expect_get_task_log().returning(|_| Ok(Vec::new()));

        let mount = ClusterStore::mount(Arc::new(mock), "c1", &PollingConfig::default())
            .await
            .unwrap();
        let state = mount.store().snapshot();
        assert!(!state.any_node_locked());
        assert!(state.can_add_node());

        // Lock cleared, so the lock poller makes no further node reads.
        tokio::time::sleep(Duration::from_secs(12)).await;
        drop(mount);
    }
}
