//! Resource monitor command.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

use labvisor::config::LabvisorConfig;
use labvisor::monitor::ResourceMonitor;
use labvisor::Result;

use super::{block_on, shutdown_signal, Services};

/// Run the resource monitor without the API.
#[derive(Parser, Debug)]
pub struct MonitorCmd {
    /// Seconds between checks; overrides the configured interval.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Run a single check and exit.
    #[arg(long)]
    once: bool,
}

impl MonitorCmd {
    /// Run the monitor command.
    pub fn run(self, mut config: LabvisorConfig) -> Result<()> {
        if let Some(secs) = self.interval {
            config.monitor.check_interval_secs = secs;
            config.validate()?;
        }

        block_on(async move {
            let services = Services::build(config)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let mut monitor = ResourceMonitor::new(
                Arc::clone(&services.orchestrator),
                services.probe(),
                services.config.monitor.clone(),
                shutdown_rx,
            );

            if self.once {
                let summary = monitor.tick().await;
                println!(
                    "evicted: {}, overloaded units: {}, expired: {}, orphans: {}",
                    summary
                        .evicted
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".into()),
                    summary.overloaded_units,
                    summary.expired,
                    summary.orphans
                );
                return Ok(());
            }

            let handle = tokio::spawn(monitor.run());
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "monitor task failed");
            }
            Ok(())
        })
    }
}
