mod allocator;
mod clients;
mod config;
mod error;
mod models;
mod polling;
mod routes;
mod store;
mod validation;
mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use clients::{Backend, BackendClient};
use routes::wizard::WizardRegistry;
use store::ClusterListStore;

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub config: Arc<config::Config>,
    pub clusters: Arc<ClusterListStore>,
    pub wizards: Arc<WizardRegistry>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kubeplan_console=info")),
        )
        .init();

    let config_path = std::env::args()
        .skip(1)
        .zip(std::env::args().skip(2))
        .find_map(|(k, v)| {
            if k == "-config" || k == "--config" {
                Some(v)
            } else {
                None
            }
        })
        .or_else(|| std::env::args().nth(1).filter(|a| !a.starts_with('-')))
        .unwrap_or_else(|| "/etc/kubeplan-console/config.yaml".to_string());

    let cfg = config::Config::load(&PathBuf::from(&config_path)).unwrap_or_else(|e| {
        eprintln!("error loading config: {}", e);
        std::process::exit(1);
    });

    let backend: Arc<dyn Backend> = match BackendClient::new(&cfg.backend) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error creating backend client: {}", e);
            std::process::exit(1);
        }
    };
    let cfg = Arc::new(cfg);

    let clusters = Arc::new(ClusterListStore::new(backend.clone()));
    if let Err(e) = clusters.refresh().await {
        warn!(backend = %cfg.backend.base_url, error = %e, "initial cluster list read failed");
    }
    let list_poller = clusters.spawn_poller(cfg.polling.cluster_list_interval());

    let wizards = Arc::new(WizardRegistry::default());
    let wizard_sweeper = wizards.spawn_sweeper(&cfg.wizards);

    let state = AppState {
        backend,
        config: cfg.clone(),
        clusters,
        wizards,
    };

    let router = routes::build_router(state);

    let listen_addr = cfg.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await.unwrap_or_else(|e| {
        eprintln!("failed to bind {}: {}", listen_addr, e);
        std::process::exit(1);
    });

    info!(backend = %cfg.backend.base_url, "kubeplan-console listening on {}", listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutting down");
            list_poller.stop();
            wizard_sweeper.stop();
        })
        .await
        .unwrap_or_else(|e| {
            eprintln!("server error: {}", e);
            std::process::exit(1);
        });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
