use axum::{
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::stream::{self, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::WatchStream;

use crate::AppState;
use crate::error::Result;
use crate::store::ClusterStore;

/// Streams the cluster view for as long as the client stays connected. The
/// store and its pollers belong to this connection and stop when it closes.
pub async fn handle_cluster_events(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let mount = ClusterStore::mount(state.backend.clone(), &name, &state.config.polling).await?;
    let changes = WatchStream::new(mount.store().subscribe());

    let events = changes.filter_map(move |snapshot| {
        // Keeps the mount (and so the pollers) alive with the stream.
        let _mount = &mount;
        let event = snapshot.view().map(|view| {
            let data = serde_json::to_string(&view).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().event("cluster").data(data))
        });
        std::future::ready(event)
    });

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response())
}

/// Workflow state and provisioning log of one wizard session.
pub async fn handle_wizard_events(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Response> {
    let wizard = state.wizards.get(id).await?;
    let (states, logs) = {
        let wizard = wizard.lock().await;
        (wizard.subscribe(), wizard.subscribe_task_log())
    };

    let states = WatchStream::new(states).map(|s| {
        let data = serde_json::to_string(&s).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("state").data(data))
    });
    let logs = WatchStream::new(logs).map(|log| {
        let data = serde_json::to_string(&log).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("task-log").data(data))
    });

    Ok(Sse::new(stream::select(states, logs))
        .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
        .into_response())
}
