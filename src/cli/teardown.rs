//! Teardown command implementation.

use clap::Parser;

use labvisor::config::LabvisorConfig;
use labvisor::lab::LabId;
use labvisor::Result;

use super::{block_on, Services};

/// Tear a lab down.
#[derive(Parser, Debug)]
pub struct TeardownCmd {
    /// Lab to tear down.
    pub lab_id: LabId,

    /// Remove the lab records after a clean teardown.
    #[arg(long)]
    pub purge: bool,
}

impl TeardownCmd {
    /// Run the teardown command.
    pub fn run(self, config: LabvisorConfig) -> Result<()> {
        block_on(async move {
            let services = Services::build(config)?;
            let report = services.orchestrator.teardown(self.lab_id).await?;

            if report.already_terminated {
                println!(
                    "Lab {} was already terminated, released {} leftover unit(s)",
                    self.lab_id,
                    report.released_units.len()
                );
            } else {
                println!(
                    "Lab {} terminated, released {} unit(s)",
                    self.lab_id,
                    report.released_units.len()
                );
            }
            for failure in &report.failures {
                println!("  failed: {}: {}", failure.step, failure.error);
            }

            if self.purge {
                if report.is_clean() {
                    services.orchestrator.store().remove_lab(self.lab_id)?;
                    println!("Removed lab {} records", self.lab_id);
                } else {
                    println!("Keeping records of lab {}: teardown left resources behind", self.lab_id);
                }
            }
            Ok(())
        })
    }
}
