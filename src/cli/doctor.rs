//! `helix doctor`: probe Docker and the configured paths.

use std::path::Path;

use crate::config::{Config, DatabaseBackend};
use crate::engine::check_docker;

enum Check {
    Pass(String),
    Fail(String),
    Skip(String),
}

impl Check {
    fn print(&self, name: &str) {
        match self {
            Check::Pass(detail) => println!("  [pass] {:<12} {}", name, detail),
            Check::Fail(detail) => println!("  [FAIL] {:<12} {}", name, detail),
            Check::Skip(detail) => println!("  [skip] {:<12} {}", name, detail),
        }
    }
}

/// Run diagnostics. Fails if any check fails.
pub async fn run_doctor_command(config: &Config) -> anyhow::Result<()> {
    println!("helix doctor");
    println!();

    let mut checks = Vec::new();

    let detection = check_docker().await;
    checks.push((
        "docker",
        if detection.status.is_ok() {
            Check::Pass(detection.status.as_str().to_string())
        } else {
            Check::Fail(format!(
                "{}. {}",
                detection.status.as_str(),
                detection.hint().unwrap_or_default()
            ))
        },
    ));

    checks.push(("data root", check_dir(&config.instances.data_root)));
    checks.push(("backup root", check_dir(&config.instances.backup_root)));

    checks.push((
        "registry",
        match config.database.backend {
            DatabaseBackend::Memory => Check::Skip("in-memory; nothing is persisted".to_string()),
            DatabaseBackend::LibSql => {
                match crate::db::connect_from_config(&config.database).await {
                    Ok(_) => Check::Pass(config.database.path.display().to_string()),
                    Err(e) => Check::Fail(e.to_string()),
                }
            }
        },
    ));

    checks.push((
        "ports",
        Check::Pass(format!(
            "preferred {}, fallback {}-{}",
            config.instances.service_port,
            config.instances.port_range_start,
            config.instances.port_range_end
        )),
    ));

    for (name, check) in &checks {
        check.print(name);
    }

    let failed = checks
        .iter()
        .filter(|(_, c)| matches!(c, Check::Fail(_)))
        .count();
    println!();
    if failed > 0 {
        anyhow::bail!("{} check(s) failed", failed);
    }
    println!("All checks passed.");
    Ok(())
}

/// A root is fine if it exists as a directory, or can be created later.
fn check_dir(path: &Path) -> Check {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Check::Pass(path.display().to_string()),
        Ok(_) => Check::Fail(format!("{} exists but is not a directory", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Check::Skip(format!("{} does not exist yet", path.display()))
        }
        Err(e) => Check::Fail(format!("{}: {}", path.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(check_dir(dir.path()), Check::Pass(_)));
        assert!(matches!(check_dir(&dir.path().join("missing")), Check::Skip(_)));

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(check_dir(&file), Check::Fail(_)));
    }
}
