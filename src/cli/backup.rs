//! Backup CLI commands.

use clap::Subcommand;

use crate::backup::{Backup, BackupId};
use crate::cli::{Services, print_json};

#[derive(Subcommand, Debug, Clone)]
pub enum BackupCommand {
    /// Archive an instance's data directory
    Create {
        /// Instance id or name
        id: String,

        /// Expected instance name; refuses if it does not match
        #[arg(long)]
        name: Option<String>,
    },

    /// List backups, newest first
    List {
        /// Only backups of this instance (id or name)
        instance: Option<String>,
    },

    /// Replace an instance's data with a backup
    Restore {
        /// Backup id, as printed by `backup list` (e.g. "alpha/backup_20250301T101500.123Z.tar.gz")
        backup: String,

        /// Target instance id or name
        target: String,
    },
}

/// Run a backup command.
pub async fn run_backup_command(
    services: &Services,
    cmd: BackupCommand,
    json: bool,
) -> anyhow::Result<()> {
    match cmd {
        BackupCommand::Create { id, name } => {
            let report = services.backups.create(&id, name.as_deref()).await?;
            if json {
                print_json(&report.backup)?;
            } else {
                println!(
                    "Backed up '{}' to {} ({:.1} MiB)",
                    report.backup.instance_name(),
                    report.backup.path.display(),
                    report.backup.size_mb()
                );
            }
            if let Some(e) = report.resume_error {
                anyhow::bail!("Backup written, but the instance could not be restarted: {}", e);
            }
            Ok(())
        }
        BackupCommand::List { instance } => {
            let listing = services.backups.list(instance.as_deref()).await?;
            let mut backups: Vec<Backup> = listing.iter().collect();
            backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            if json {
                return print_json(&backups);
            }
            if backups.is_empty() {
                println!("No backups found.");
                return Ok(());
            }
            println!("  {:<56} {:>10} {}", "BACKUP", "SIZE", "CREATED");
            for b in &backups {
                println!(
                    "  {:<56} {:>8.1}MB {}",
                    b.id.to_string(),
                    b.size_mb(),
                    b.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!();
            println!("  {} backup(s)", backups.len());
            Ok(())
        }
        BackupCommand::Restore { backup, target } => {
            let backup_id: BackupId = backup.parse()?;
            let report = services.backups.restore(&backup_id, &target).await?;
            if json {
                print_json(&report.instance)?;
            } else {
                println!(
                    "Restored {} into '{}' ({})",
                    report.backup, report.instance.name, report.instance.status
                );
            }
            if let Some(e) = report.resume_error {
                anyhow::bail!("Data restored, but the instance could not be restarted: {}", e);
            }
            Ok(())
        }
    }
}
