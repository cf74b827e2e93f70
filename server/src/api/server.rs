//! API server initialization

use std::net::SocketAddr;

use anyhow::Result;
use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::{AppState, routes, ws};
use crate::core::CoreApp;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    /// Serve until shutdown; returns the CoreApp for teardown
    pub async fn start(self) -> Result<CoreApp> {
        let app = self.app;
        let shutdown = app.shutdown.clone();

        let addr = SocketAddr::new(app.config.server.host.parse()?, app.config.server.port);

        let state = AppState {
            supervisor: app.supervisor.clone(),
            cluster: app.cluster.clone(),
            started_at: app.started_at,
        };

        let router = Router::new()
            .route("/health", get(routes::health))
            .route("/stats", get(routes::stats))
            .route("/broadcast", post(routes::broadcast))
            .route("/history", get(routes::history))
            .route("/ws", get(ws::ws_handler))
            .layer(cors_layer(&app.config.server.cors_origin))
            .with_state(state);

        tracing::info!(%addr, "Gateway listening");

        let listener = TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.finished())
        .await?;

        Ok(app)
    }
}

/// CORS from configuration: `*` allows any origin, anything else is exact
fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin = if origin == "*" {
        AllowOrigin::any()
    } else {
        match origin.parse::<HeaderValue>() {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(%origin, "Invalid CORS origin, falling back to any");
                AllowOrigin::any()
            }
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}
