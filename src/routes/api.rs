use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::{Error, Result};
use crate::models::cluster::{ClusterNode, ClusterResource, HelmApp, NodeResources, NodeType};
use crate::models::views::{ClusterListView, ClusterView};
use crate::store::ClusterStore;

/// Stores behind these handlers live for one request, so gates always see
/// the backend's current locks.
async fn load_store(state: &AppState, name: &str) -> Result<ClusterStore> {
    let store = ClusterStore::new(state.backend.clone());
    store.load_topology(name).await?;
    Ok(store)
}

#[derive(Debug, Deserialize)]
pub struct RoleQuery {
    pub role: NodeType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteClusterBody {
    pub confirm_name: String,
}

pub async fn handle_healthz() -> &'static str {
    "ok"
}

pub async fn handle_list_clusters(State(state): State<AppState>) -> Json<ClusterListView> {
    Json(state.clusters.view())
}

pub async fn handle_get_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClusterView>> {
    let store = load_store(&state, &name).await?;
    // Fresh topology: the joins below report every status as unknown until
    // the event stream delivers a refresh.
    let view = store.view().ok_or(Error::NoTopology)?;
    Ok(Json(view))
}

pub async fn handle_delete_cluster(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<DeleteClusterBody>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.delete_cluster(&body.confirm_name).await?;
    if let Err(e) = state.clusters.refresh().await {
        warn!(error = %e, "cluster list refresh after delete failed");
    }
    Ok(StatusCode::ACCEPTED)
}

pub async fn handle_propose_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RoleQuery>,
) -> Result<Json<ClusterNode>> {
    let store = load_store(&state, &name).await?;
    let alloc = &state.config.allocation;
    let node = store.propose_node(query.role, &alloc.default_master.to_node(), alloc.block_step())?;
    Ok(Json(node))
}

pub async fn handle_add_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(node): Json<ClusterNode>,
) -> Result<(StatusCode, Json<ClusterNode>)> {
    let store = load_store(&state, &name).await?;
    let created = store.add_node(node).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn handle_change_node_resources(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
    Json(resources): Json<NodeResources>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.change_node_resources(&node, resources).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn handle_delete_node(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> Result<Json<ClusterNode>> {
    let store = load_store(&state, &name).await?;
    Ok(Json(store.delete_node(&node).await?))
}

pub async fn handle_add_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(app): Json<HelmApp>,
) -> Result<(StatusCode, Json<Value>)> {
    let store = load_store(&state, &name).await?;
    let id = store.add_helm_app(app).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn handle_update_app(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(app): Json<HelmApp>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.update_helm_app(app).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_delete_app(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.delete_helm_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_install_app(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.install_helm_app(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn handle_uninstall_app(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.uninstall_helm_app(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn handle_add_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(resource): Json<ClusterResource>,
) -> Result<(StatusCode, Json<Value>)> {
    let store = load_store(&state, &name).await?;
    let id = store.add_cluster_resource(resource).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn handle_update_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(resource): Json<ClusterResource>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.update_cluster_resource(resource).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_delete_resource(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.delete_cluster_resource(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_install_resource(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.install_cluster_resource(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn handle_uninstall_resource(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let store = load_store(&state, &name).await?;
    store.uninstall_cluster_resource(&id).await?;
    Ok(StatusCode::ACCEPTED)
}
