//! HTTP surface for Runway.
//!
//! Every job endpoint answers HTTP 200 with a `{status, msg}` body; a
//! failed job is reported in `status`, never through the HTTP status.
//!
//! ```rust,ignore
//! use runway::api::{ApiConfig, ApiServer};
//!
//! let server = ApiServer::new(ApiConfig::from_server(&config.server)?, orchestrator);
//! server.run_with_shutdown(shutdown_signal()).await?;
//! ```

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{ApiError, ApiResult};
pub use state::AppState;
pub use types::{ApiResponse, ResponseStatus};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::service::Orchestrator;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Address to bind the server to
    pub bind_address: SocketAddr,
    /// Whether to enable CORS
    pub enable_cors: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8000)),
            enable_cors: true,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

impl ApiConfig {
    /// Build from the `[server]` section.
    pub fn from_server(server: &ServerConfig) -> Result<Self> {
        let bind_address = server
            .bind
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address '{}': {}", server.bind, e)))?;
        Ok(Self {
            bind_address,
            enable_cors: server.enable_cors,
            max_body_size: server.max_body_size,
        })
    }

    pub fn with_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }
}

/// The HTTP server.
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            state: Arc::new(AppState::new(orchestrator)),
        }
    }

    /// Build the router with all routes and layers.
    pub fn router(&self) -> Router {
        let mut app = routes::api_routes(Arc::clone(&self.state));

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }

        app.layer(RequestBodyLimitLayer::new(self.config.max_body_size))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server with graceful shutdown support.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::result::Result<(), std::io::Error> {
        let addr = self.config.bind_address;
        let router = self.router();

        info!("Starting Runway API server on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
