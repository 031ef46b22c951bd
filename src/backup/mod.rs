//! Crash-consistent backups of instance data directories.
//!
//! A backup quiesces the instance (stop), archives its data directory, and
//! brings it back to the state it was in before. Restore validates the
//! archive first, then swaps the data directory under the same stop/resume
//! bracket. At most one backup or restore runs per instance at a time.
//!
//! ```text
//! backup_root/
//!   alpha/
//!     backup_20250301T101500.123Z.tar.gz
//!     backup_20250302T080000.000Z.tar.gz
//!   beta/
//!     ...
//! ```

mod archive;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ManagerError, Result};
use crate::lifecycle::{LifecycleManager, validate_name};
use crate::registry::{Instance, InstanceStatus};

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_SUFFIX: &str = ".tar.gz";

/// Identifies one archive: `<instance_name>/<file_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BackupId {
    pub instance_name: String,
    pub file_name: String,
}

impl BackupId {
    fn is_backup_file(file_name: &str) -> bool {
        file_name.starts_with(BACKUP_PREFIX)
            && file_name.ends_with(BACKUP_SUFFIX)
            && !file_name.contains(['/', '\\'])
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_name, self.file_name)
    }
}

impl FromStr for BackupId {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ManagerError::InvalidConfig {
            key: "backup".to_string(),
            reason: format!(
                "'{}' is not of the form <instance>/{}<timestamp>{}",
                s, BACKUP_PREFIX, BACKUP_SUFFIX
            ),
        };
        let (instance_name, file_name) = s.split_once('/').ok_or_else(invalid)?;
        if validate_name(instance_name).is_err() || !Self::is_backup_file(file_name) {
            return Err(invalid());
        }
        Ok(Self {
            instance_name: instance_name.to_string(),
            file_name: file_name.to_string(),
        })
    }
}

/// One archive on disk. Metadata comes from the file itself.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub id: BackupId,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl Backup {
    pub fn instance_name(&self) -> &str {
        &self.id.instance_name
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }

    fn from_path(instance_name: &str, path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_string();
        if !BackupId::is_backup_file(&file_name) {
            return None;
        }
        let meta = std::fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);
        Some(Self {
            id: BackupId {
                instance_name: instance_name.to_string(),
                file_name,
            },
            path,
            created_at,
            size_bytes: meta.len(),
        })
    }
}

/// Outcome of a successful archive. The archive and the resume are
/// reported separately: a written backup does not imply the instance is
/// running again.
#[derive(Debug)]
pub struct BackupReport {
    pub backup: Backup,
    /// Set when the instance was running before and could not be started again.
    pub resume_error: Option<ManagerError>,
}

/// Outcome of a successful restore.
#[derive(Debug)]
pub struct RestoreReport {
    pub instance: Instance,
    pub backup: BackupId,
    pub resume_error: Option<ManagerError>,
}

/// Lazily-walked view of the backup tree. Each call to [`iter`](Self::iter)
/// scans the directory afresh; order is filesystem order.
#[derive(Debug, Clone)]
pub struct BackupListing {
    root: PathBuf,
    instance: Option<String>,
}

impl BackupListing {
    pub fn iter(&self) -> BackupIter {
        let dirs = match &self.instance {
            Some(name) => vec![(name.clone(), self.root.join(name))],
            None => std::fs::read_dir(&self.root)
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                        .filter_map(|e| {
                            let name = e.file_name().to_str()?.to_string();
                            Some((name, e.path()))
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };
        BackupIter {
            pending_dirs: dirs,
            current: None,
        }
    }
}

impl<'a> IntoIterator for &'a BackupListing {
    type Item = Backup;
    type IntoIter = BackupIter;

    fn into_iter(self) -> BackupIter {
        self.iter()
    }
}

/// Iterator over [`Backup`]s, reading one directory at a time.
pub struct BackupIter {
    pending_dirs: Vec<(String, PathBuf)>,
    current: Option<(String, std::fs::ReadDir)>,
}

impl Iterator for BackupIter {
    type Item = Backup;

    fn next(&mut self) -> Option<Backup> {
        loop {
            if let Some((name, entries)) = self.current.as_mut() {
                for entry in entries.by_ref() {
                    let Ok(entry) = entry else { continue };
                    if let Some(backup) = Backup::from_path(name, entry.path()) {
                        return Some(backup);
                    }
                }
                self.current = None;
            }

            let (name, dir) = self.pending_dirs.pop()?;
            match std::fs::read_dir(&dir) {
                Ok(entries) => self.current = Some((name, entries)),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!("Skipping unreadable backup dir {}: {}", dir.display(), e);
                    }
                }
            }
        }
    }
}

/// Marks an instance as having a backup or restore in flight.
struct InFlight {
    name: String,
    set: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.name);
    }
}

/// Starts the instance again if dropped while armed.
///
/// The normal path disarms it and resumes explicitly so the result can be
/// reported; this only covers panics and cancelled futures.
struct ResumeGuard {
    lifecycle: Arc<LifecycleManager>,
    instance_id: String,
    armed: bool,
}

impl ResumeGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lifecycle = Arc::clone(&self.lifecycle);
        let id = self.instance_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lifecycle.start(&id).await {
                        tracing::error!(container_id = %id, "Deferred resume failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::error!(container_id = %id, "Instance left stopped: no runtime to resume it");
            }
        }
    }
}

/// Creates, lists and restores backups.
pub struct BackupEngine {
    lifecycle: Arc<LifecycleManager>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl BackupEngine {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            lifecycle,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn backup_root(&self) -> &Path {
        &self.lifecycle.config().backup_root
    }

    fn mark_in_flight(&self, name: &str) -> Result<InFlight> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(name.to_string()) {
            return Err(ManagerError::InstanceBusy {
                instance: name.to_string(),
            });
        }
        Ok(InFlight {
            name: name.to_string(),
            set: Arc::clone(&self.in_flight),
        })
    }

    async fn resolve_active(&self, id: &str) -> Result<Instance> {
        match self.lifecycle.registry().resolve(id).await? {
            Some(instance) if instance.is_active() => Ok(instance),
            _ => Err(ManagerError::instance_not_found(id)),
        }
    }

    /// Stop the instance if running and arm a resume guard for it.
    async fn quiesce(&self, instance: &mut Instance) -> Result<(bool, ResumeGuard)> {
        let was_running = instance.status == InstanceStatus::Running;
        if was_running {
            self.lifecycle.stop_locked(instance).await?;
        }
        Ok((
            was_running,
            ResumeGuard {
                lifecycle: Arc::clone(&self.lifecycle),
                instance_id: instance.id.clone(),
                armed: was_running,
            },
        ))
    }

    async fn resume(
        &self,
        instance: &mut Instance,
        was_running: bool,
        mut guard: ResumeGuard,
    ) -> Option<ManagerError> {
        guard.disarm();
        if !was_running {
            return None;
        }
        match self.lifecycle.start_locked(instance).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(instance = %instance.name, "Could not resume after backup: {}", e);
                Some(e)
            }
        }
    }

    /// Snapshot an instance's data directory.
    ///
    /// `name`, when given, must match the instance's name; the backup
    /// directory is always scoped by the registry name.
    pub async fn create(&self, instance_id: &str, name: Option<&str>) -> Result<BackupReport> {
        let found = self.resolve_active(instance_id).await?;
        if let Some(name) = name
            && name != found.name
        {
            return Err(ManagerError::InvalidConfig {
                key: "name".to_string(),
                reason: format!("instance {} is named '{}', not '{}'", instance_id, found.name, name),
            });
        }

        let _in_flight = self.mark_in_flight(&found.name)?;
        let (_lock, mut instance) = self.lifecycle.lock_instance(&found.id).await?;

        if !matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Stopped
        ) || instance.cleanup_pending
        {
            return Err(ManagerError::BackupFailed {
                instance: instance.name.clone(),
                reason: format!("instance is {}", instance.status),
                resume_error: None,
            });
        }

        let (was_running, guard) = match self.quiesce(&mut instance).await {
            Ok(quiesced) => quiesced,
            Err(e) => {
                return Err(ManagerError::BackupFailed {
                    instance: instance.name.clone(),
                    reason: format!("could not stop instance: {}", e),
                    resume_error: None,
                });
            }
        };

        let dir = self.lifecycle.config().backup_dir(&instance.name);
        let file_name = format!(
            "{}{}{}",
            BACKUP_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            BACKUP_SUFFIX
        );
        let dest = dir.join(&file_name);
        let source = instance.data_path.clone();

        tracing::info!(instance = %instance.name, backup = %file_name, "Archiving data directory");
        let archived = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&dir)?;
                if dest.exists() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("{} already exists", dest.display()),
                    ));
                }
                archive::archive(&source, &dest)
            })
            .await
        };
        let archived = match archived {
            Ok(Ok(size)) => Ok(size),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("archive task failed: {}", e)),
        };

        let resume_error = self.resume(&mut instance, was_running, guard).await;

        match archived {
            Ok(size) => {
                tracing::info!(
                    instance = %instance.name,
                    backup = %file_name,
                    size_bytes = size,
                    "Backup written"
                );
                let backup = Backup::from_path(&instance.name, dest).ok_or_else(|| {
                    ManagerError::BackupFailed {
                        instance: instance.name.clone(),
                        reason: "archive vanished after writing".to_string(),
                        resume_error: resume_error.as_ref().map(ToString::to_string),
                    }
                })?;
                Ok(BackupReport {
                    backup,
                    resume_error,
                })
            }
            Err(reason) => {
                tracing::error!(instance = %instance.name, "Backup failed: {}", reason);
                Err(ManagerError::BackupFailed {
                    instance: instance.name.clone(),
                    reason,
                    resume_error: resume_error.map(|e| e.to_string()),
                })
            }
        }
    }

    /// Backups on disk, optionally for one instance (by id or name).
    pub async fn list(&self, instance_id: Option<&str>) -> Result<BackupListing> {
        let instance = match instance_id {
            Some(id) => Some(match self.lifecycle.registry().resolve(id).await? {
                Some(instance) => instance.name,
                // Backups outlive their instance, so a bare name is accepted too.
                None if validate_name(id).is_ok() => id.to_string(),
                None => return Err(ManagerError::instance_not_found(id)),
            }),
            None => None,
        };
        Ok(BackupListing {
            root: self.backup_root().to_path_buf(),
            instance,
        })
    }

    /// Look up a backup by id.
    pub fn get(&self, id: &BackupId) -> Result<Backup> {
        let path = self
            .backup_root()
            .join(&id.instance_name)
            .join(&id.file_name);
        Backup::from_path(&id.instance_name, path).ok_or_else(|| ManagerError::NotFound {
            what: format!("Backup '{}'", id),
        })
    }

    /// Replace the target's data directory with the archive's contents.
    ///
    /// The archive is validated before anything is stopped or touched. The
    /// target is left running only if it was running before.
    pub async fn restore(&self, backup_id: &BackupId, target_id: &str) -> Result<RestoreReport> {
        let backup = self.get(backup_id)?;
        let found = self.resolve_active(target_id).await?;
        let _in_flight = self.mark_in_flight(&found.name)?;

        let archive_path = backup.path.clone();
        let summary = tokio::task::spawn_blocking(move || archive::validate(&archive_path))
            .await
            .map_err(|e| ManagerError::CorruptBackup {
                backup: backup_id.to_string(),
                reason: format!("validation task failed: {}", e),
            })?
            .map_err(|reason| ManagerError::CorruptBackup {
                backup: backup_id.to_string(),
                reason,
            })?;
        tracing::debug!(
            backup = %backup_id,
            entries = summary.entries,
            unpacked_bytes = summary.unpacked_bytes,
            "Backup validated"
        );

        let (_lock, mut instance) = self.lifecycle.lock_instance(&found.id).await?;
        if !matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Stopped
        ) || instance.cleanup_pending
        {
            return Err(ManagerError::InvalidTransition {
                instance: instance.name.clone(),
                from: instance.status.to_string(),
                to: "restoring".to_string(),
            });
        }

        let (was_running, guard) = self.quiesce(&mut instance).await?;

        tracing::info!(instance = %instance.name, backup = %backup_id, "Restoring data directory");
        let archive_path = backup.path.clone();
        let data_path = instance.data_path.clone();
        let swapped = tokio::task::spawn_blocking(move || replace_dir(&archive_path, &data_path))
            .await
            .map_err(|e| format!("restore task failed: {}", e))
            .and_then(|r| r.map_err(|e| e.to_string()));

        let resume_error = self.resume(&mut instance, was_running, guard).await;

        match swapped {
            Ok(()) => {
                tracing::info!(instance = %instance.name, backup = %backup_id, "Restore complete");
                Ok(RestoreReport {
                    instance,
                    backup: backup_id.clone(),
                    resume_error,
                })
            }
            Err(reason) => Err(ManagerError::BackupFailed {
                instance: instance.name.clone(),
                reason: format!("restore from {} failed: {}", backup_id, reason),
                resume_error: resume_error.map(|e| e.to_string()),
            }),
        }
    }
}

/// Unpack `archive_path` next to `data_path`, then swap it into place.
///
/// The old directory is moved aside first and put back if the final rename
/// fails.
fn replace_dir(archive_path: &Path, data_path: &Path) -> std::io::Result<()> {
    let parent = data_path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", data_path.display()),
        )
    })?;
    let base = data_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let staging = parent.join(format!(".{}.restore-{}", base, tag));
    let aside = parent.join(format!(".{}.replaced-{}", base, tag));

    let restored = match archive::unpack(archive_path, &staging) {
        Ok(root) => root,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    let had_old = data_path.exists();
    if had_old {
        std::fs::rename(data_path, &aside)?;
    }
    if let Err(e) = std::fs::rename(&restored, data_path) {
        if had_old {
            let _ = std::fs::rename(&aside, data_path);
        }
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if had_old && let Err(e) = std::fs::remove_dir_all(&aside) {
        tracing::warn!("Could not delete replaced data at {}: {}", aside.display(), e);
    }
    let _ = std::fs::remove_dir_all(&staging);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use crate::engine::{ContainerState, EngineOp};
    use crate::error::EngineError;
    use crate::testing::TestHarness;

    #[test]
    fn test_backup_id_parse_display() {
        let id: BackupId = "alpha/backup_20250301T101500.123Z.tar.gz".parse().unwrap();
        assert_eq!(id.instance_name, "alpha");
        assert_eq!(id.to_string(), "alpha/backup_20250301T101500.123Z.tar.gz");

        assert!("alpha".parse::<BackupId>().is_err());
        assert!("alpha/notes.txt".parse::<BackupId>().is_err());
        assert!("../x/backup_1.tar.gz".parse::<BackupId>().is_err());
        assert!("alpha/sub/backup_1.tar.gz".parse::<BackupId>().is_err());
    }

    #[tokio::test]
    async fn test_backup_resumes_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        let instance = h
            .lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        std::fs::write(instance.data_path.join("level.dat"), b"world").unwrap();

        let report = h.backups.create(&instance.id, Some("alpha")).await.unwrap();
        assert!(report.resume_error.is_none());
        assert_eq!(report.backup.instance_name(), "alpha");
        assert!(report.backup.size_bytes > 0);
        assert_eq!(h.engine.calls(EngineOp::Stop), 1);
        assert_eq!(
            h.engine.container_state(&instance.id),
            Some(ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn test_backup_of_stopped_instance_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        let instance = h
            .lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        h.lifecycle.stop("alpha").await.unwrap();
        let starts = h.engine.calls(EngineOp::Start);

        h.backups.create("alpha", None).await.unwrap();
        assert_eq!(h.engine.calls(EngineOp::Start), starts);
        let row = h.registry.get(&instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_resume_failure_reported_separately() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        h.lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        h.engine.fail_next(
            EngineOp::Start,
            EngineError::Unavailable {
                reason: "daemon busy".to_string(),
            },
        );

        let report = h.backups.create("alpha", None).await.unwrap();
        assert!(matches!(
            report.resume_error,
            Some(ManagerError::EngineUnavailable { .. })
        ));
        assert!(report.backup.path.is_file());
    }

    #[tokio::test]
    async fn test_name_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        h.lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();

        let err = h.backups.create("alpha", Some("beta")).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidConfig { .. }));
        assert_eq!(h.engine.calls(EngineOp::Stop), 0);
    }

    #[tokio::test]
    async fn test_busy_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        h.lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();

        let _held = h.backups.mark_in_flight("alpha").unwrap();
        let err = h.backups.create("alpha", None).await.unwrap_err();
        assert!(matches!(err, ManagerError::InstanceBusy { .. }));
    }

    #[tokio::test]
    async fn test_listing_is_restartable_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        for name in ["alpha", "beta"] {
            h.lifecycle
                .create(name, None, &HashMap::new())
                .await
                .unwrap();
            h.backups.create(name, None).await.unwrap();
        }
        std::fs::write(h.config.backup_dir("alpha").join("notes.txt"), b"x").unwrap();

        let all = h.backups.list(None).await.unwrap();
        assert_eq!(all.iter().count(), 2);
        assert_eq!(all.iter().count(), 2);

        let alpha = h.backups.list(Some("alpha")).await.unwrap();
        let names: Vec<String> = alpha.iter().map(|b| b.id.instance_name).collect();
        assert_eq!(names, vec!["alpha".to_string()]);

        assert!(h.backups.list(Some("../etc")).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_rejects_empty_archive_before_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        let instance = h
            .lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        std::fs::write(instance.data_path.join("level.dat"), b"live").unwrap();

        let backup_dir = h.config.backup_dir("alpha");
        std::fs::create_dir_all(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("backup_bad.tar.gz"), b"").unwrap();
        let id: BackupId = "alpha/backup_bad.tar.gz".parse().unwrap();

        let err = h.backups.restore(&id, "alpha").await.unwrap_err();
        assert!(matches!(err, ManagerError::CorruptBackup { .. }));
        assert_eq!(h.engine.calls(EngineOp::Stop), 0);
        assert_eq!(
            std::fs::read(instance.data_path.join("level.dat")).unwrap(),
            b"live"
        );
    }

    #[tokio::test]
    async fn test_restore_missing_backup_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let h = TestHarness::new(dir.path());
        h.lifecycle
            .create("alpha", None, &HashMap::new())
            .await
            .unwrap();
        let id: BackupId = "alpha/backup_missing.tar.gz".parse().unwrap();
        let err = h.backups.restore(&id, "alpha").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound { .. }));
    }
}
