//! HTTP API server command.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use labvisor::api::state::ApiState;
use labvisor::config::LabvisorConfig;
use labvisor::monitor::ResourceMonitor;
use labvisor::service::LabService;
use labvisor::Result;

use super::{block_on, shutdown_signal, Services};

/// Start the HTTP API server and the resource monitor.
#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Listen address; overrides the configured one.
    #[arg(short, long)]
    listen: Option<String>,

    /// Serve the API without the resource monitor.
    #[arg(long)]
    no_monitor: bool,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, mut config: LabvisorConfig) -> Result<()> {
        if let Some(listen) = self.listen.clone() {
            config.server.listen = listen;
        }
        let addr = config.listen_addr()?;

        block_on(async move {
            let services = Services::build(config)?;
            services.orchestrator.ensure_network().await?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let monitor = if self.no_monitor {
                None
            } else {
                let monitor = ResourceMonitor::new(
                    Arc::clone(&services.orchestrator),
                    services.probe(),
                    services.config.monitor.clone(),
                    shutdown_rx,
                );
                Some(tokio::spawn(monitor.run()))
            };

            let service = Arc::new(LabService::new(
                Arc::clone(&services.orchestrator),
                services.config.lab.clone(),
            ));
            let app = labvisor::api::create_router(Arc::new(ApiState::new(service)));

            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(address = %addr, "starting HTTP API server");
            println!("labvisor API server listening on http://{}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            // Stop the monitor after in-flight requests are done
            let _ = shutdown_tx.send(true);
            if let Some(handle) = monitor {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "monitor task failed");
                }
            }
            tracing::info!("server stopped");
            Ok(())
        })
    }
}
