//! `runway serve`

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use runway::api::{ApiConfig, ApiServer};
use runway::service::Orchestrator;
use tracing::info;

use super::CommandContext;

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Address to listen on, overriding `[server].bind`
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

impl ServeArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let orchestrator = Orchestrator::from_config(&ctx.config)?;
        orchestrator
            .ensure_data_dirs()
            .context("preparing data directories")?;

        let mut api_config = ApiConfig::from_server(&ctx.config.server)?;
        if let Some(addr) = self.bind {
            api_config = api_config.with_address(addr);
        }
        info!(
            data_path = %ctx.config.server.data_path.display(),
            workers = ctx.config.server.worker_pool_size,
            forks = ctx.config.execution.forks,
            "Runway ready"
        );

        ApiServer::new(api_config, orchestrator)
            .run_with_shutdown(shutdown_signal())
            .await
            .context("API server stopped")?;
        Ok(0)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
