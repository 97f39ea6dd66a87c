//! CLI command implementations.

pub mod cleanup;
pub mod list;
pub mod monitor;
pub mod serve;
pub mod teardown;

use std::future::Future;
use std::sync::Arc;

use labvisor::allocator::Allocator;
use labvisor::config::LabvisorConfig;
use labvisor::db::LabStore;
use labvisor::orchestrator::{Orchestrator, OrchestratorSettings};
use labvisor::probe::{ResourceProbe, SysinfoProbe};
use labvisor::runtime::{ContainerRuntime, DockerCli};
use labvisor::vpn::OpenVpnProvisioner;
use labvisor::Result;

/// Long-lived services shared by the commands that touch labs.
pub struct Services {
    pub config: LabvisorConfig,
    pub orchestrator: Arc<Orchestrator>,
}

impl Services {
    /// Open the store, connect the capabilities and restore allocations.
    pub fn build(config: LabvisorConfig) -> Result<Self> {
        let db_path = config.db_path()?;
        let store = Arc::new(LabStore::open(&db_path)?);
        tracing::debug!(path = %db_path.display(), "opened lab store");

        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerCli::new(config.runtime.docker_bin.clone()));
        let vpn = Arc::new(OpenVpnProvisioner::new(Arc::clone(&runtime), &config)?);
        let allocator = Arc::new(Allocator::new(&config)?);

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            runtime,
            vpn,
            allocator,
            OrchestratorSettings::from_config(&config),
        ));
        let restored = orchestrator.restore_allocations()?;
        tracing::debug!(labs = restored, "restored allocations");

        Ok(Self {
            config,
            orchestrator,
        })
    }

    /// Host probe for the monitor.
    pub fn probe(&self) -> Arc<dyn ResourceProbe> {
        Arc::new(SysinfoProbe::new(self.config.monitor.disk_path.clone()))
    }
}

/// Run a future to completion on a fresh multi-threaded runtime.
pub fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}

/// Resolve once Ctrl-C is received.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
