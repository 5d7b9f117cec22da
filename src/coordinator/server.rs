//! Coordinator server

use crate::cluster::LocalCluster;
use crate::common::{Config, Result};
use crate::coordinator::http::{create_router, CoordState};

pub struct Coordinator {
    config: Config,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let coordinator = &self.config.coordinator;
        tracing::info!("Starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", coordinator.bind_addr);
        tracing::info!("  Local nodes: {}", coordinator.local_nodes);
        match &coordinator.db_path {
            Some(path) => tracing::info!("  DB path: {}", path.display()),
            None => tracing::info!("  DB path: none (in-memory cluster state)"),
        }

        // Update logs live next to the cluster records when persistence is on.
        let data_dir = coordinator.db_path.as_ref().map(|p| p.join("logs"));
        let cluster = LocalCluster::start(&self.config, data_dir)?;

        let router = create_router(CoordState {
            store: cluster.store().clone(),
            admin: cluster.admin().clone(),
            router: cluster.router().clone(),
        });

        let listener = tokio::net::TcpListener::bind(coordinator.bind_addr).await?;
        tracing::info!("✓ Coordinator ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await;
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
        }

        cluster.shutdown();
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}
