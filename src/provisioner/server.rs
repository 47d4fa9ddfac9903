//! Provisioning server implementation
//!
//! Wires the HTTP router to a [`NodeLifecycleManager`] and runs it until a
//! shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics;

use super::api::create_router;
use super::config::{ConfigError, ServerConfig};
use super::manager::NodeLifecycleManager;

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<NodeLifecycleManager>,
    pub start_time: Instant,
    pub config: ServerConfig,
}

// ============================================================================
// Provisioner Server
// ============================================================================

/// HTTP front end of the provisioning controller
pub struct ProvisionerServer {
    state: AppState,
}

impl ProvisionerServer {
    pub fn new(config: ServerConfig, manager: Arc<NodeLifecycleManager>) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            state: AppState {
                manager,
                start_time: Instant::now(),
                config,
            },
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// API routes plus the optional CORS and trace layers
    pub fn build_router(&self) -> Router {
        let config = &self.state.config;
        let router =
            create_router(self.state.clone()).route_layer(middleware::from_fn(track_requests));

        let router = if config.enable_cors {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        };

        if config.enable_request_logging {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        }
    }

    /// Serve until `shutdown_signal` resolves, then unmount any templates
    /// still mounted.
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let addr = self.state.config.bind_address;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        tracing::info!(%addr, "Provisioning server listening");

        let served = axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await;

        self.state.manager.shutdown().await;
        served.map_err(ServerError::Serve)?;

        tracing::info!("Provisioning server stopped");
        Ok(())
    }

    pub fn info(&self) -> ServerInfo {
        let config = &self.state.config;
        ServerInfo {
            bind_address: config.bind_address,
            max_upload_mib: config.max_upload_mib,
            cors_enabled: config.enable_cors,
            request_logging_enabled: config.enable_request_logging,
        }
    }
}

/// Count every request by its route template
async fn track_requests(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics::record_api_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Summary printed by `bakery serve` at startup
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub max_upload_mib: u64,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    pub fn display(&self) -> String {
        let on_off = |flag: bool| if flag { "on" } else { "off" };
        [
            format!("  Listen:          {}", self.bind_address),
            format!("  Upload limit:    {} MiB", self.max_upload_mib),
            format!("  CORS:            {}", on_off(self.cors_enabled)),
            format!("  Request tracing: {}", on_off(self.request_logging_enabled)),
        ]
        .join("\n")
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server terminated: {0}")]
    Serve(#[source] std::io::Error),
}
