//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::heartbeat::HeartbeatReceiver;
use crate::incident::TargetLocks;
use crate::notify::NotificationFanout;
use crate::probe::ProbeExecutor;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub receiver: Arc<HeartbeatReceiver>,
    pub fanout: Arc<NotificationFanout>,
    pub prober: Arc<ProbeExecutor>,
    pub locks: Arc<TargetLocks>,
}

/// HTTP surface of the monitor.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        receiver: Arc<HeartbeatReceiver>,
        fanout: Arc<NotificationFanout>,
        prober: Arc<ProbeExecutor>,
        locks: Arc<TargetLocks>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                receiver,
                fanout,
                prober,
                locks,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Ingress
            .route("/api/heartbeat/{id}", post(handlers::handle_heartbeat))
            .route("/api/probe", post(handlers::handle_probe))
            // Targets
            .route("/api/targets", get(handlers::handle_get_targets))
            .route("/api/targets", post(handlers::handle_create_target))
            .route("/api/targets/{id}", delete(handlers::handle_delete_target))
            .route("/api/targets/{id}/incidents", get(handlers::handle_get_incidents))
            .route("/api/targets/{id}/sla", get(handlers::handle_get_sla))
            .route("/api/incidents/{id}/diagnostics", get(handlers::handle_get_diagnostics))
            // Notifications
            .route(
                "/api/targets/{id}/notifications/test",
                post(handlers::handle_test_notification),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `stop` fires.
    pub async fn start(&self, stop: &broadcast::Sender<()>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let mut stop_rx = stop.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
