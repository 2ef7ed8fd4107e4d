use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::RoleQuery;
use crate::AppState;
use crate::config::WizardConfig;
use crate::error::{Error, Result};
use crate::models::cluster::{ClusterNode, ClusterResource, HelmApp, ProvisionStages};
use crate::polling::PollingTask;
use crate::workflow::{
    ClusterSettings, HostSettings, ProvisioningWizard, WizardSettings, WizardSnapshot,
    WorkflowState,
};

pub type SharedWizard = Arc<Mutex<ProvisioningWizard>>;

struct Session {
    wizard: SharedWizard,
    state: watch::Receiver<WorkflowState>,
    touched: Instant,
}

/// Open wizard sessions by id. Sessions nobody touches for a while are
/// swept; a provisioning still running is never swept.
#[derive(Default)]
pub struct WizardRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<u64, Session>>,
}

impl WizardRegistry {
    pub async fn insert(&self, wizard: ProvisioningWizard) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session {
            state: wizard.subscribe(),
            wizard: Arc::new(Mutex::new(wizard)),
            touched: Instant::now(),
        };
        self.sessions.write().await.insert(id, session);
        id
    }

    /// Counts as activity on the session.
    pub async fn get(&self, id: u64) -> Result<SharedWizard> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("wizard {}", id)))?;
        session.touched = Instant::now();
        Ok(session.wizard.clone())
    }

    pub async fn touch(&self, id: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.touched = Instant::now();
        }
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        match self.sessions.write().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("wizard {}", id))),
        }
    }

    /// Drop finished sessions idle for `finished_grace` and drafts idle for
    /// `idle_timeout`. Returns how many were dropped.
    pub async fn sweep(&self, idle_timeout: Duration, finished_grace: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let state = session.state.borrow();
            let limit = match *state {
                WorkflowState::Provisioning => return true,
                ref finished if finished.is_terminal() => finished_grace,
                _ => idle_timeout,
            };
            let keep = now.duration_since(session.touched) < limit;
            if !keep {
                info!(wizard = *id, state = ?*state, "wizard session expired");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cfg: &WizardConfig) -> PollingTask {
        let registry = self.clone();
        let idle_timeout = cfg.idle_timeout();
        let finished_grace = cfg.finished_grace();
        PollingTask::spawn(
            "wizard-sweep",
            cfg.sweep_interval(),
            move || {
                let registry = registry.clone();
                async move { Ok::<_, Error>(registry.sweep(idle_timeout, finished_grace).await) }
            },
            |swept| {
                if swept > 0 {
                    debug!(swept, "wizard sessions swept");
                }
            },
        )
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedWizard {
    pub id: u64,
    #[serde(flatten)]
    pub snapshot: WizardSnapshot,
}

pub async fn handle_create(State(state): State<AppState>) -> Result<(StatusCode, Json<CreatedWizard>)> {
    let wizard = ProvisioningWizard::start(
        state.backend.clone(),
        WizardSettings::from_config(&state.config),
    )
    .await?;
    let snapshot = wizard.snapshot();
    let id = state.wizards.insert(wizard).await;
    Ok((StatusCode::CREATED, Json(CreatedWizard { id, snapshot })))
}

pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<WizardSnapshot>> {
    let wizard = state.wizards.get(id).await?;
    let snapshot = wizard.lock().await.snapshot();
    Ok(Json(snapshot))
}

/// A running provisioning keeps going; only the session is forgotten.
pub async fn handle_discard(State(state): State<AppState>, Path(id): Path<u64>) -> Result<StatusCode> {
    state.wizards.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run `edit` against the session and answer with its new snapshot.
async fn edit(
    state: &AppState,
    id: u64,
    edit: impl FnOnce(&mut ProvisioningWizard) -> Result<()>,
) -> Result<Json<WizardSnapshot>> {
    let wizard = state.wizards.get(id).await?;
    let mut wizard = wizard.lock().await;
    edit(&mut wizard)?;
    Ok(Json(wizard.snapshot()))
}

pub async fn handle_update_settings(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(settings): Json<HostSettings>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.update_settings(settings)).await
}

pub async fn handle_update_cluster(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(settings): Json<ClusterSettings>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.update_cluster(settings)).await
}

pub async fn handle_propose_node(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<RoleQuery>,
) -> Result<Json<ClusterNode>> {
    let wizard = state.wizards.get(id).await?;
    let node = wizard.lock().await.propose_node(query.role)?;
    Ok(Json(node))
}

pub async fn handle_add_node(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(node): Json<ClusterNode>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.add_node(node)).await
}

pub async fn handle_update_node(
    State(state): State<AppState>,
    Path((id, vm_id)): Path<(u64, u32)>,
    Json(node): Json<ClusterNode>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.update_node(vm_id, node)).await
}

pub async fn handle_delete_node(
    State(state): State<AppState>,
    Path((id, vm_id)): Path<(u64, u32)>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.delete_node(vm_id)).await
}

pub async fn handle_add_app(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(app): Json<HelmApp>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.add_helm_app(app)).await
}

pub async fn handle_update_app(
    State(state): State<AppState>,
    Path((id, release)): Path<(u64, String)>,
    Json(app): Json<HelmApp>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.update_helm_app(&release, app)).await
}

pub async fn handle_delete_app(
    State(state): State<AppState>,
    Path((id, release)): Path<(u64, String)>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.delete_helm_app(&release)).await
}

pub async fn handle_add_resource(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(resource): Json<ClusterResource>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.add_resource(resource)).await
}

pub async fn handle_update_resource(
    State(state): State<AppState>,
    Path((id, name)): Path<(u64, String)>,
    Json(resource): Json<ClusterResource>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.update_resource(&name, resource)).await
}

pub async fn handle_delete_resource(
    State(state): State<AppState>,
    Path((id, name)): Path<(u64, String)>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.delete_resource(&name)).await
}

pub async fn handle_next(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.go_next().map(drop)).await
}

pub async fn handle_previous(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.go_previous().map(drop)).await
}

pub async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.cancel_confirmation().map(drop)).await
}

pub async fn handle_set_stages(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(stages): Json<ProvisionStages>,
) -> Result<Json<WizardSnapshot>> {
    edit(&state, id, |w| w.set_stages(stages)).await
}

/// Starts provisioning in the background. Progress is followed through the
/// session's event stream.
pub async fn handle_confirm(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<(StatusCode, Json<WizardSnapshot>)> {
    let wizard = state.wizards.get(id).await?;
    let mut wizard = wizard.lock().await;
    let job = wizard.confirm()?;

    let clusters = state.clusters.clone();
    let wizards = state.wizards.clone();
    let cluster = job.cluster_name().to_string();
    tokio::spawn(async move {
        let end = job.run().await;
        if matches!(end, WorkflowState::Succeeded) {
            info!(cluster = %cluster, wizard = id, "provisioning finished");
        }
        // The grace period for finished sessions starts now.
        wizards.touch(id).await;
        if let Err(e) = clusters.refresh().await {
            warn!(error = %e, "cluster list refresh after provisioning failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(wizard.snapshot())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockBackend;
    use crate::models::cluster::{ClusterRequest, Network, NodeType};

    fn settings() -> WizardSettings {
        WizardSettings {
            block_step: crate::allocator::BlockStep(5),
            default_master: ClusterNode {
                vm_id: 999,
                name: "master-1".into(),
                cores: 2,
                memory: 2048,
                ip_address: String::new(),
                storage_pool: String::new(),
                node_type: NodeType::Master,
                lock: None,
            },
            task_log_interval: Duration::from_secs(2),
        }
    }

    fn ready_request() -> ClusterRequest {
        ClusterRequest {
            os_image: "ubuntu-22.04".into(),
            os_image_storage: "local".into(),
            kube_version: "1.29".into(),
            node: "pve".into(),
            cluster_name: "demo".into(),
            node_username: "ops".into(),
            node_password: "secret".into(),
            disk_size: 32,
            nodes: vec![ClusterNode {
                vm_id: 100,
                name: "master-1".into(),
                cores: 2,
                memory: 4096,
                ip_address: "10.0.0.10".into(),
                storage_pool: "local-lvm".into(),
                node_type: NodeType::Master,
                lock: None,
            }],
            network: Network {
                gateway: "10.0.0.1".into(),
                subnet_mask: 24,
                dns: "1.1.1.1".into(),
                bridge: "vmbr0".into(),
            },
            ..Default::default()
        }
    }

    async fn wizard() -> ProvisioningWizard {
        let mut mock = MockBackend::new();
        mock.expect_generate_default_cluster()
            .returning(|| Ok(ClusterRequest::default()));
        ProvisioningWizard::start(Arc::new(mock), settings()).await.unwrap()
    }

    /// A wizard walked up to confirmation on a backend that provisions
    /// instantly.
    async fn confirmable() -> ProvisioningWizard {
        let mut mock = MockBackend::new();
        mock.expect_generate_default_cluster()
            .returning(|| Ok(ready_request()));
        mock.expect_clear_task_log().returning(|_| Ok(()));
        mock.expect_create_cluster().returning(|_| Ok(()));
        mock.expect_get_task_log().returning(|_| Ok(Vec::new()));
        let mut w = ProvisioningWizard::start(Arc::new(mock), settings()).await.unwrap();
        for _ in 0..5 {
            w.go_next().unwrap();
        }
        w
    }

    #[tokio::test]
    async fn sessions_get_distinct_ids_and_can_be_removed() {
        let registry = WizardRegistry::default();
        let a = registry.insert(wizard().await).await;
        let b = registry.insert(wizard().await).await;
        assert_ne!(a, b);

        assert!(registry.get(a).await.is_ok());
        registry.remove(a).await.unwrap();
        assert!(matches!(registry.get(a).await, Err(Error::NotFound(_))));
        assert!(matches!(registry.remove(a).await, Err(Error::NotFound(_))));
        assert!(registry.get(b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_and_finished_sessions_but_not_running_ones() {
        let idle_timeout = Duration::from_secs(3600);
        let grace = Duration::from_secs(600);
        let registry = WizardRegistry::default();

        let stale = registry.insert(wizard().await).await;
        let active = registry.insert(wizard().await).await;

        let mut done = confirmable().await;
        let end = done.confirm().unwrap().run().await;
        assert_eq!(end, WorkflowState::Succeeded);
        let finished = registry.insert(done).await;

        let mut running = confirmable().await;
        let _job = running.confirm().unwrap();
        let running = registry.insert(running).await;

        tokio::time::sleep(Duration::from_secs(700)).await;
        assert_eq!(registry.sweep(idle_timeout, grace).await, 1);
        assert!(matches!(registry.get(finished).await, Err(Error::NotFound(_))));
        registry.touch(active).await;

        tokio::time::sleep(Duration::from_secs(3000)).await;
        assert_eq!(registry.sweep(idle_timeout, grace).await, 1);
        assert!(matches!(registry.get(stale).await, Err(Error::NotFound(_))));
        assert!(registry.get(active).await.is_ok());

        tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
        registry.sweep(idle_timeout, grace).await;
        let kept = registry.get(running).await.unwrap();
        assert_eq!(kept.lock().await.state(), WorkflowState::Provisioning);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_expires_sessions_on_its_own() {
        let registry = Arc::new(WizardRegistry::default());
        let cfg = WizardConfig {
            sweep_interval_secs: 60,
            idle_timeout_secs: 300,
            finished_grace_secs: 60,
        };
        let _sweeper = registry.spawn_sweeper(&cfg);

        let id = registry.insert(wizard().await).await;
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(registry.get(id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(matches!(registry.get(id).await, Err(Error::NotFound(_))));
    }
}
