//! One-shot expiry sweep.

use chrono::Utc;
use clap::Parser;

use labvisor::config::LabvisorConfig;
use labvisor::Result;

use super::{block_on, Services};

/// Tear down every expired lab now.
#[derive(Parser, Debug)]
pub struct CleanupCmd {
    /// Also release lab-managed units no live lab owns.
    #[arg(long)]
    orphans: bool,
}

impl CleanupCmd {
    /// Run the cleanup command.
    pub fn run(self, config: LabvisorConfig) -> Result<()> {
        block_on(async move {
            let services = Services::build(config)?;
            let expired = services
                .orchestrator
                .cleanup_expired_labs(Utc::now())
                .await?;
            println!("Reclaimed {} expired lab(s)", expired);

            if self.orphans {
                let orphans = services.orchestrator.reconcile_orphans().await?;
                println!("Released {} orphaned unit(s)", orphans);
            }
            Ok(())
        })
    }
}
