//! List command implementation.

use chrono::Utc;
use clap::Args;

use labvisor::config::LabvisorConfig;
use labvisor::db::LabStore;
use labvisor::lab::LabStatus;
use labvisor::util::{format_remaining, truncate};

/// List labs.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Include terminated labs.
    #[arg(short, long)]
    pub all: bool,

    /// Show VMs under each lab.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, config: LabvisorConfig) -> labvisor::Result<()> {
        let store = LabStore::open(&config.db_path()?)?;
        let mut labs = store.list_labs()?;
        if !self.all {
            labs.retain(|lab| lab.status != LabStatus::Terminated);
        }

        if labs.is_empty() {
            if !self.json {
                println!("No labs found");
            } else {
                println!("[]");
            }
            return Ok(());
        }

        let now = Utc::now();
        if self.json {
            let mut json_labs = Vec::with_capacity(labs.len());
            for lab in &labs {
                let vms = store.lab_vms(lab.id)?;
                json_labs.push(serde_json::json!({
                    "lab": lab,
                    "vms": vms,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&json_labs)?);
        } else {
            // Table output
            println!(
                "{:<6} {:<20} {:<8} {:<10} {:<13} {:<4} {:<10}",
                "ID", "NAME", "OWNER", "CHALLENGE", "STATUS", "VMS", "REMAINING"
            );
            println!("{}", "-".repeat(76));

            for lab in &labs {
                let vms = store.lab_vms(lab.id)?;
                println!(
                    "{:<6} {:<20} {:<8} {:<10} {:<13} {:<4} {:<10}",
                    lab.id,
                    truncate(&lab.name, 18),
                    lab.owner,
                    lab.challenge_id,
                    lab.status,
                    vms.len(),
                    format_remaining(lab.expires_at, now),
                );

                if self.verbose {
                    for vm in &vms {
                        println!(
                            "  {:<18} {:<8} {:<12} {:<15} ssh:{}",
                            truncate(&vm.name, 18),
                            vm.vm_type,
                            vm.status,
                            vm.internal_ip.as_deref().unwrap_or("-"),
                            vm.ssh_port
                                .map(|p| p.to_string())
                                .unwrap_or_else(|| "-".into()),
                        );
                        if let Some(note) = &vm.diagnostic {
                            println!("    {}", note);
                        }
                    }
                    println!();
                }
            }
        }

        Ok(())
    }
}
