pub mod api;
pub mod sse;
pub mod wizard;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::error::Error;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Clusters
        .route("/api/v1/clusters", get(api::handle_list_clusters))
        .route(
            "/api/v1/clusters/{name}",
            get(api::handle_get_cluster).delete(api::handle_delete_cluster),
        )
        .route("/api/v1/clusters/{name}/events", get(sse::handle_cluster_events))
        // Nodes
        .route("/api/v1/clusters/{name}/nodes", post(api::handle_add_node))
        .route(
            "/api/v1/clusters/{name}/nodes/proposal",
            get(api::handle_propose_node),
        )
        .route(
            "/api/v1/clusters/{name}/nodes/{node}",
            delete(api::handle_delete_node),
        )
        .route(
            "/api/v1/clusters/{name}/nodes/{node}/resources",
            put(api::handle_change_node_resources),
        )
        // Helm apps
        .route(
            "/api/v1/clusters/{name}/apps",
            post(api::handle_add_app).put(api::handle_update_app),
        )
        .route("/api/v1/clusters/{name}/apps/{id}", delete(api::handle_delete_app))
        .route(
            "/api/v1/clusters/{name}/apps/{id}/install",
            post(api::handle_install_app),
        )
        .route(
            "/api/v1/clusters/{name}/apps/{id}/uninstall",
            delete(api::handle_uninstall_app),
        )
        // Cluster resources
        .route(
            "/api/v1/clusters/{name}/cluster-resources",
            post(api::handle_add_resource).put(api::handle_update_resource),
        )
        .route(
            "/api/v1/clusters/{name}/cluster-resources/{id}",
            delete(api::handle_delete_resource),
        )
        .route(
            "/api/v1/clusters/{name}/cluster-resources/{id}/install",
            post(api::handle_install_resource),
        )
        .route(
            "/api/v1/clusters/{name}/cluster-resources/{id}/uninstall",
            delete(api::handle_uninstall_resource),
        )
        // Creation wizard
        .route("/api/v1/wizards", post(wizard::handle_create))
        .route(
            "/api/v1/wizards/{id}",
            get(wizard::handle_get).delete(wizard::handle_discard),
        )
        .route("/api/v1/wizards/{id}/events", get(sse::handle_wizard_events))
        .route("/api/v1/wizards/{id}/settings", put(wizard::handle_update_settings))
        .route("/api/v1/wizards/{id}/cluster", put(wizard::handle_update_cluster))
        .route("/api/v1/wizards/{id}/nodes", post(wizard::handle_add_node))
        .route(
            "/api/v1/wizards/{id}/nodes/proposal",
            get(wizard::handle_propose_node),
        )
        .route(
            "/api/v1/wizards/{id}/nodes/{vm_id}",
            put(wizard::handle_update_node).delete(wizard::handle_delete_node),
        )
        .route("/api/v1/wizards/{id}/apps", post(wizard::handle_add_app))
        .route(
            "/api/v1/wizards/{id}/apps/{release}",
            put(wizard::handle_update_app).delete(wizard::handle_delete_app),
        )
        .route("/api/v1/wizards/{id}/resources", post(wizard::handle_add_resource))
        .route(
            "/api/v1/wizards/{id}/resources/{resource}",
            put(wizard::handle_update_resource).delete(wizard::handle_delete_resource),
        )
        .route("/api/v1/wizards/{id}/next", post(wizard::handle_next))
        .route("/api/v1/wizards/{id}/previous", post(wizard::handle_previous))
        .route("/api/v1/wizards/{id}/cancel", post(wizard::handle_cancel))
        .route("/api/v1/wizards/{id}/stages", put(wizard::handle_set_stages))
        .route("/api/v1/wizards/{id}/confirm", post(wizard::handle_confirm))
        // Health
        .route("/healthz", get(api::handle_healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NodeLocked(_) | Error::ClusterBusy(_) | Error::InvalidTransition(_) => {
                StatusCode::CONFLICT
            }
            Error::NotFound(_) | Error::NoTopology => StatusCode::NOT_FOUND,
            Error::Backend { status: 404, .. } => StatusCode::NOT_FOUND,
            Error::Http(_) | Error::Backend { .. } => StatusCode::BAD_GATEWAY,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            Error::Validation(errors) => json!({ "error": "validation failed", "fields": errors }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
