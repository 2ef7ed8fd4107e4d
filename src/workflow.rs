//! Cluster creation wizard.
//!
//! `Draft → ConfirmPending → Provisioning → {Succeeded, Failed}`. The draft
//! starts from the backend's generated default and is edited step by step;
//! each step validates before the wizard moves forward. Once provisioning
//! starts the wizard can no longer be edited or cancelled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::allocator::{self, BlockStep};
use crate::clients::Backend;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::cluster::{
    ClusterNode, ClusterRequest, ClusterResource, HelmApp, LogEntry, Network, NodeType,
    ProvisionRequest, ProvisionStages, vm_id_asc,
};
use crate::polling::PollingTask;
use crate::validation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WizardStep {
    Settings,
    Cluster,
    Nodes,
    Apps,
    Workloads,
}

impl WizardStep {
    pub fn next(self) -> Option<Self> {
        match self {
            WizardStep::Settings => Some(WizardStep::Cluster),
            WizardStep::Cluster => Some(WizardStep::Nodes),
            WizardStep::Nodes => Some(WizardStep::Apps),
            WizardStep::Apps => Some(WizardStep::Workloads),
            WizardStep::Workloads => None,
        }
    }

    pub fn previous(self) -> Option<Self> {
        match self {
            WizardStep::Settings => None,
            WizardStep::Cluster => Some(WizardStep::Settings),
            WizardStep::Nodes => Some(WizardStep::Cluster),
            WizardStep::Apps => Some(WizardStep::Nodes),
            WizardStep::Workloads => Some(WizardStep::Apps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum WorkflowState {
    Draft { step: WizardStep },
    ConfirmPending { stages: ProvisionStages },
    Provisioning,
    Succeeded,
    Failed { error: String, log: Vec<LogEntry> },
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Succeeded | WorkflowState::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WizardSettings {
    pub block_step: BlockStep,
    pub default_master: ClusterNode,
    pub task_log_interval: Duration,
}

impl WizardSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            block_step: cfg.allocation.block_step(),
            default_master: cfg.allocation.default_master.to_node(),
            task_log_interval: cfg.polling.task_log_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSettings {
    pub node: String,
    pub os_image: String,
    pub os_image_storage: String,
    pub kube_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    pub cluster_name: String,
    pub node_username: String,
    pub node_password: String,
    pub disk_size: u32,
    pub network: Network,
}

/// What a wizard session shows at a point in time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardSnapshot {
    pub state: WorkflowState,
    pub draft: ClusterRequest,
    pub task_log: Vec<LogEntry>,
}

pub struct ProvisioningWizard {
    backend: Arc<dyn Backend>,
    settings: WizardSettings,
    template: ClusterNode,
    draft: ClusterRequest,
    stages: ProvisionStages,
    state: Arc<watch::Sender<WorkflowState>>,
    task_log: Arc<watch::Sender<Vec<LogEntry>>>,
}

impl ProvisioningWizard {
    /// Fetch the backend's default configuration and open a draft on it.
    pub async fn start(backend: Arc<dyn Backend>, settings: WizardSettings) -> Result<Self> {
        let mut draft = backend.generate_default_cluster().await?;
        vm_id_asc(&mut draft.nodes);

        // First generated master seeds proposals once the draft has no nodes.
        let template = draft
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Master)
            .cloned()
            .unwrap_or_else(|| settings.default_master.clone());

        let (state, _) = watch::channel(WorkflowState::Draft {
            step: WizardStep::Settings,
        });
        let (task_log, _) = watch::channel(Vec::new());
        info!(cluster = %draft.cluster_name, "wizard started");

        Ok(Self {
            backend,
            settings,
            template,
            draft,
            stages: ProvisionStages::default(),
            state: Arc::new(state),
            task_log: Arc::new(task_log),
        })
    }

    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    pub fn subscribe_task_log(&self) -> watch::Receiver<Vec<LogEntry>> {
        self.task_log.subscribe()
    }

    pub fn draft(&self) -> &ClusterRequest {
        &self.draft
    }

    pub fn snapshot(&self) -> WizardSnapshot {
        WizardSnapshot {
            state: self.state(),
            draft: self.draft.clone(),
            task_log: self.task_log.borrow().clone(),
        }
    }

    fn transition(&self, next: WorkflowState) {
        info!(cluster = %self.draft.cluster_name, from = ?*self.state.borrow(), to = ?next, "wizard transition");
        self.state.send_replace(next);
    }

    fn ensure_draft(&self) -> Result<WizardStep> {
        match *self.state.borrow() {
            WorkflowState::Draft { step } => Ok(step),
            ref other => Err(Error::invalid_transition(format!(
                "draft cannot be edited while {:?}",
                other
            ))),
        }
    }

    pub fn update_settings(&mut self, settings: HostSettings) -> Result<()> {
        self.ensure_draft()?;
        self.draft.node = settings.node;
        self.draft.os_image = settings.os_image;
        self.draft.os_image_storage = settings.os_image_storage;
        self.draft.kube_version = settings.kube_version;
        Ok(())
    }

    pub fn update_cluster(&mut self, settings: ClusterSettings) -> Result<()> {
        self.ensure_draft()?;
        self.draft.cluster_name = settings.cluster_name;
        self.draft.node_username = settings.node_username;
        self.draft.node_password = settings.node_password;
        self.draft.disk_size = settings.disk_size;
        self.draft.network = settings.network;
        Ok(())
    }

    pub fn propose_node(&self, role: NodeType) -> Result<ClusterNode> {
        self.ensure_draft()?;
        Ok(allocator::propose_node(
            &self.draft.nodes,
            role,
            &self.template,
            self.settings.block_step,
        ))
    }

    pub fn add_node(&mut self, node: ClusterNode) -> Result<()> {
        self.ensure_draft()?;
        validation::validate_node(&node, &self.draft.nodes).into_result()?;
        self.draft.nodes.push(node);
        vm_id_asc(&mut self.draft.nodes);
        Ok(())
    }

    pub fn update_node(&mut self, vm_id: u32, node: ClusterNode) -> Result<()> {
        self.ensure_draft()?;
        let idx = self
            .draft
            .nodes
            .iter()
            .position(|n| n.vm_id == vm_id)
            .ok_or_else(|| Error::not_found(format!("node {}", vm_id)))?;
        let others: Vec<ClusterNode> = self
            .draft
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, n)| n.clone())
            .collect();
        validation::validate_node(&node, &others).into_result()?;
        self.draft.nodes[idx] = node;
        vm_id_asc(&mut self.draft.nodes);
        Ok(())
    }

    pub fn delete_node(&mut self, vm_id: u32) -> Result<()> {
        self.ensure_draft()?;
        let before = self.draft.nodes.len();
        self.draft.nodes.retain(|n| n.vm_id != vm_id);
        if self.draft.nodes.len() == before {
            return Err(Error::not_found(format!("node {}", vm_id)));
        }
        Ok(())
    }

    pub fn add_helm_app(&mut self, app: HelmApp) -> Result<()> {
        self.ensure_draft()?;
        validation::validate_helm_app(&app, &self.draft.helm_apps).into_result()?;
        self.draft.helm_apps.push(app);
        Ok(())
    }

    pub fn update_helm_app(&mut self, release_name: &str, app: HelmApp) -> Result<()> {
        self.ensure_draft()?;
        let idx = self
            .draft
            .helm_apps
            .iter()
            .position(|a| a.release_name == release_name)
            .ok_or_else(|| Error::not_found(format!("helm app {}", release_name)))?;
        let others: Vec<HelmApp> = self
            .draft
            .helm_apps
            .iter()
            .filter(|a| a.release_name != release_name)
            .cloned()
            .collect();
        validation::validate_helm_app(&app, &others).into_result()?;
        self.draft.helm_apps[idx] = app;
        Ok(())
    }

    pub fn delete_helm_app(&mut self, release_name: &str) -> Result<()> {
        self.ensure_draft()?;
        let before = self.draft.helm_apps.len();
        self.draft.helm_apps.retain(|a| a.release_name != release_name);
        if self.draft.helm_apps.len() == before {
            return Err(Error::not_found(format!("helm app {}", release_name)));
        }
        Ok(())
    }

    pub fn add_resource(&mut self, resource: ClusterResource) -> Result<()> {
        self.ensure_draft()?;
        validation::validate_resource(&resource, &self.draft.cluster_resources).into_result()?;
        self.draft.cluster_resources.push(resource);
        Ok(())
    }

    pub fn update_resource(&mut self, name: &str, resource: ClusterResource) -> Result<()> {
        self.ensure_draft()?;
        let idx = self
            .draft
            .cluster_resources
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::not_found(format!("cluster resource {}", name)))?;
        let others: Vec<ClusterResource> = self
            .draft
            .cluster_resources
            .iter()
            .filter(|r| r.name != name)
            .cloned()
            .collect();
        validation::validate_resource(&resource, &others).into_result()?;
        self.draft.cluster_resources[idx] = resource;
        Ok(())
    }

    pub fn delete_resource(&mut self, name: &str) -> Result<()> {
        self.ensure_draft()?;
        let before = self.draft.cluster_resources.len();
        self.draft.cluster_resources.retain(|r| r.name != name);
        if self.draft.cluster_resources.len() == before {
            return Err(Error::not_found(format!("cluster resource {}", name)));
        }
        Ok(())
    }

    pub fn validate_step(&self, step: WizardStep) -> Result<()> {
        let errors = match step {
            WizardStep::Settings => validation::validate_settings(&self.draft),
            WizardStep::Cluster => validation::validate_cluster(&self.draft),
            WizardStep::Nodes => validation::validate_nodes(&self.draft.nodes),
            WizardStep::Apps => validation::validate_helm_apps(&self.draft.helm_apps),
            WizardStep::Workloads => validation::validate_resources(&self.draft.cluster_resources),
        };
        errors.into_result()
    }

    /// Validate the current step and advance. Past the last step the wizard
    /// waits for confirmation with the current stage selection.
    pub fn go_next(&mut self) -> Result<WorkflowState> {
        let step = self.ensure_draft()?;
        self.validate_step(step)?;
        let next = match step.next() {
            Some(step) => WorkflowState::Draft { step },
            None => WorkflowState::ConfirmPending {
                stages: self.stages,
            },
        };
        self.transition(next.clone());
        Ok(next)
    }

    pub fn go_previous(&mut self) -> Result<WorkflowState> {
        let step = self.ensure_draft()?;
        let previous = step
            .previous()
            .ok_or_else(|| Error::invalid_transition("already at the first step"))?;
        let next = WorkflowState::Draft { step: previous };
        self.transition(next.clone());
        Ok(next)
    }

    /// Stages can only be chosen while waiting for confirmation.
    pub fn set_stages(&mut self, stages: ProvisionStages) -> Result<()> {
        match *self.state.borrow() {
            WorkflowState::ConfirmPending { .. } => {}
            ref other => {
                return Err(Error::invalid_transition(format!(
                    "stages cannot be chosen while {:?}",
                    other
                )));
            }
        }
        self.stages = stages;
        self.state
            .send_replace(WorkflowState::ConfirmPending { stages });
        Ok(())
    }

    pub fn cancel_confirmation(&mut self) -> Result<WorkflowState> {
        if !matches!(*self.state.borrow(), WorkflowState::ConfirmPending { .. }) {
            return Err(Error::invalid_transition("nothing to cancel"));
        }
        let next = WorkflowState::Draft {
            step: WizardStep::Workloads,
        };
        self.transition(next.clone());
        Ok(next)
    }

    /// Leave ConfirmPending. The returned job performs the provisioning.
    pub fn confirm(&mut self) -> Result<ProvisionJob> {
        let stages = match *self.state.borrow() {
            WorkflowState::ConfirmPending { stages } => stages,
            ref other => {
                return Err(Error::invalid_transition(format!(
                    "cannot provision while {:?}",
                    other
                )));
            }
        };
        self.transition(WorkflowState::Provisioning);

        Ok(ProvisionJob {
            backend: self.backend.clone(),
            request: ProvisionRequest {
                stages,
                cluster: self.draft.clone(),
            },
            state: self.state.clone(),
            task_log: self.task_log.clone(),
            interval: self.settings.task_log_interval,
        })
    }
}

/// One provisioning run. Owns everything it needs so it can be spawned.
pub struct ProvisionJob {
    backend: Arc<dyn Backend>,
    request: ProvisionRequest,
    state: Arc<watch::Sender<WorkflowState>>,
    task_log: Arc<watch::Sender<Vec<LogEntry>>>,
    interval: Duration,
}

impl fmt::Debug for ProvisionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionJob")
            .field("cluster", &self.request.cluster.cluster_name)
            .field("stages", &self.request.stages)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ProvisionJob {
    pub fn cluster_name(&self) -> &str {
        &self.request.cluster.cluster_name
    }

    pub async fn run(self) -> WorkflowState {
        let name = self.request.cluster.cluster_name.clone();

        if let Err(e) = self.backend.clear_task_log(&name).await {
            warn!(cluster = %name, error = %e, "could not clear task log");
        }

        let poller = {
            let backend = self.backend.clone();
            let task_log = self.task_log.clone();
            let name = name.clone();
            PollingTask::spawn(
                "task-log",
                self.interval,
                move || {
                    let backend = backend.clone();
                    let name = name.clone();
                    async move { backend.get_task_log(&name).await }
                },
                move |log| {
                    task_log.send_replace(log);
                },
            )
        };

        info!(cluster = %name, stages = ?self.request.stages, "provisioning started");
        let outcome = self.backend.create_cluster(&self.request).await;
        poller.stop();

        match self.backend.get_task_log(&name).await {
            Ok(log) => {
                self.task_log.send_replace(log);
            }
            Err(e) => warn!(cluster = %name, error = %e, "final task log read failed"),
        }

        let next = match outcome {
            Ok(()) => {
                info!(cluster = %name, "provisioning succeeded");
                WorkflowState::Succeeded
            }
            Err(e) => {
                warn!(cluster = %name, error = %e, "provisioning failed");
                WorkflowState::Failed {
                    error: e.to_string(),
                    log: self.task_log.borrow().clone(),
                }
            }
        };
        self.state.send_replace(next.clone());
        next
    }
}
