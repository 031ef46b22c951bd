//! Instance lifecycle and inspection commands.

use std::collections::HashMap;

use crate::cli::{Command, Services, print_json};
use crate::registry::Instance;

/// Run an instance command. `Backup` and `Doctor` are dispatched elsewhere.
pub async fn run_instance_command(
    services: &Services,
    cmd: Command,
    json: bool,
) -> anyhow::Result<()> {
    let lifecycle = &services.lifecycle;

    match cmd {
        Command::Create { name, version, env } => {
            let env: HashMap<String, String> = env.into_iter().collect();
            let instance = lifecycle.create(&name, version.as_deref(), &env).await?;
            if json {
                return print_json(&instance);
            }
            println!(
                "Created '{}' ({}) on port {}",
                instance.name, instance.id, instance.host_port
            );
            println!("  Data: {}", instance.data_path.display());
        }
        Command::Start { id } => {
            let instance = lifecycle.start(&id).await?;
            print_transition(&instance, "Started", json)?;
        }
        Command::Stop { id } => {
            let instance = lifecycle.stop(&id).await?;
            print_transition(&instance, "Stopped", json)?;
        }
        Command::Restart { id } => {
            let instance = lifecycle.restart(&id).await?;
            print_transition(&instance, "Restarted", json)?;
        }
        Command::Remove { id } => {
            let instance = lifecycle.remove(&id).await?;
            print_transition(&instance, "Removed", json)?;
        }
        Command::List { all, engine } => {
            if engine {
                let containers = lifecycle.list_engine_containers().await?;
                if json {
                    return print_json(&containers);
                }
                if containers.is_empty() {
                    println!("No containers.");
                    return Ok(());
                }
                println!("  {:<24} {:<12} {:<12} {}", "NAME", "STATE", "ID", "PORTS");
                for c in &containers {
                    let ports: Vec<String> = c.ports.iter().map(u16::to_string).collect();
                    println!(
                        "  {:<24} {:<12} {:<12} {}",
                        c.name,
                        c.state,
                        short_id(&c.id),
                        ports.join(",")
                    );
                }
                return Ok(());
            }

            let instances = if all {
                lifecycle.list_all().await?
            } else {
                lifecycle.list().await?
            };
            if json {
                return print_json(&instances);
            }
            print_instances(&instances);
        }
        Command::Status { id } => {
            let report = lifecycle.status(&id).await?;
            if json {
                return print_json(&report);
            }
            let instance = &report.instance;
            println!("{} ({})", instance.name, instance.id);
            println!("  Status:   {}", instance.status);
            match report.engine_state {
                Some(state) => println!("  Engine:   {}", state),
                None => println!("  Engine:   (no container)"),
            }
            println!("  Version:  {}", instance.version);
            println!("  Port:     {}", instance.host_port);
            println!("  Data:     {}", instance.data_path.display());
            println!("  Created:  {}", instance.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            for mount in &report.bind_mounts {
                println!("  Mount:    {}", mount.to_bind_string());
            }
            if instance.cleanup_pending {
                println!("  Cleanup pending: run `helix remove {}` again", instance.name);
            }
        }
        Command::Stats { id } => {
            let stats = lifecycle.stats(&id).await?;
            if json {
                return print_json(&stats);
            }
            println!("{} ({})", stats.name, stats.id);
            println!("  Memory: {:.1} MiB", stats.memory_usage_mb());
            println!("  CPU:    {}", stats.cpu_usage_units);
        }
        Command::Logs {
            id,
            lines,
            timestamps,
        } => {
            let records = services.logs.tail_records(&id, lines).await?;
            if json {
                return print_json(&records);
            }
            for record in &records {
                match (timestamps, record.timestamp) {
                    (true, Some(ts)) => {
                        println!("{} {}", ts.format("%Y-%m-%dT%H:%M:%S%.3fZ"), record.message)
                    }
                    _ => println!("{}", record.message),
                }
            }
        }
        Command::Backup(_) | Command::Doctor => {
            anyhow::bail!("not an instance command")
        }
    }

    Ok(())
}

fn print_transition(instance: &Instance, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(instance);
    }
    println!("{} '{}' ({})", verb, instance.name, instance.status);
    Ok(())
}

fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }

    println!(
        "  {:<20} {:<10} {:<7} {:<10} {:<12} {}",
        "NAME", "STATUS", "PORT", "VERSION", "ID", "CREATED"
    );
    for i in instances {
        let status = if i.cleanup_pending {
            format!("{}*", i.status)
        } else {
            i.status.to_string()
        };
        println!(
            "  {:<20} {:<10} {:<7} {:<10} {:<12} {}",
            i.name,
            status,
            i.host_port,
            i.version,
            short_id(&i.id),
            i.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    if instances.iter().any(|i| i.cleanup_pending) {
        println!();
        println!("  * cleanup pending; re-run `helix remove` to finish");
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
