//! Backup and restore against real directories, with the fake engine
//! standing in for Docker.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use pretty_assertions::assert_eq;

use helix::backup::BackupId;
use helix::engine::EngineOp;
use helix::error::{EngineError, ManagerError};
use helix::registry::InstanceStatus;
use helix::testing::TestHarness;

/// Every file under `root`, keyed by relative path.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .to_string();
            if entry.file_type().unwrap().is_dir() {
                out.insert(format!("{rel}/"), Vec::new());
                walk(root, &path, out);
            } else {
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn populate(data: &Path) {
    std::fs::create_dir_all(data.join("world/region")).unwrap();
    std::fs::create_dir_all(data.join("logs")).unwrap();
    std::fs::write(data.join("server.properties"), b"motd=hello\nmax-players=20\n").unwrap();
    std::fs::write(data.join("world/level.dat"), [0u8, 1, 2, 3, 255, 254]).unwrap();
    let region: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(data.join("world/region/r.0.0.mca"), region).unwrap();
}

#[tokio::test]
async fn restore_into_same_instance_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&alpha.data_path);
    let before = snapshot(&alpha.data_path);

    let report = h.backups.create("alpha", Some("alpha")).await.unwrap();
    assert!(report.resume_error.is_none());
    assert!(report.backup.size_bytes > 0);
    assert!(report.backup.path.starts_with(h.config.backup_dir("alpha")));
    assert_eq!(
        h.registry.get(&alpha.id).await.unwrap().unwrap().status,
        InstanceStatus::Running
    );

    // Mutate after the snapshot.
    std::fs::write(alpha.data_path.join("server.properties"), b"motd=changed").unwrap();
    std::fs::remove_dir_all(alpha.data_path.join("world/region")).unwrap();
    std::fs::write(alpha.data_path.join("new-file.txt"), b"should vanish").unwrap();

    let id: BackupId = report.backup.id.to_string().parse().unwrap();
    let restored = h.backups.restore(&id, &alpha.id).await.unwrap();
    assert!(restored.resume_error.is_none());
    assert_eq!(restored.instance.status, InstanceStatus::Running);

    assert_eq!(snapshot(&alpha.data_path), before);
}

#[tokio::test]
async fn restore_into_recreated_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let first = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&first.data_path);
    let before = snapshot(&first.data_path);
    let backup = h.backups.create(&first.id, None).await.unwrap().backup;

    h.lifecycle.remove("alpha").await.unwrap();
    assert!(!first.data_path.exists());

    // Backups outlive their instance.
    let listing = h.backups.list(Some("alpha")).await.unwrap();
    assert_eq!(listing.iter().count(), 1);

    let second = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    h.lifecycle.stop(&second.id).await.unwrap();

    let report = h.backups.restore(&backup.id, "alpha").await.unwrap();
    assert_eq!(report.instance.id, second.id);
    // Was stopped, stays stopped.
    assert_eq!(report.instance.status, InstanceStatus::Stopped);
    assert_eq!(snapshot(&second.data_path), before);
}

#[tokio::test]
async fn failed_archive_leaves_instance_running() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    std::fs::remove_dir_all(&alpha.data_path).unwrap();

    let err = h.backups.create("alpha", None).await.unwrap_err();
    match err {
        ManagerError::BackupFailed {
            instance,
            resume_error,
            ..
        } => {
            assert_eq!(instance, "alpha");
            assert!(resume_error.is_none());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let row = h.registry.get(&alpha.id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Running);
    assert!(h.engine.container_state(&alpha.id).unwrap().is_running());
    assert_eq!(h.engine.calls(EngineOp::Stop), 1);
    assert_eq!(h.engine.calls(EngineOp::Start), 2);

    let listing = h.backups.list(Some("alpha")).await.unwrap();
    assert_eq!(listing.iter().count(), 0);
}

#[tokio::test]
async fn failed_resume_is_reported_alongside_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&alpha.data_path);

    h.engine.fail_next(
        EngineOp::Start,
        EngineError::Unavailable {
            reason: "daemon restarting".to_string(),
        },
    );
    let report = h.backups.create("alpha", None).await.unwrap();
    assert!(matches!(
        report.resume_error,
        Some(ManagerError::EngineUnavailable { .. })
    ));
    assert!(report.backup.path.is_file());

    let row = h.registry.get(&alpha.id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn corrupt_archive_is_rejected_before_touching_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&alpha.data_path);
    let before = snapshot(&alpha.data_path);

    let backup_dir = h.config.backup_dir("alpha");
    std::fs::create_dir_all(&backup_dir).unwrap();
    std::fs::write(
        backup_dir.join("backup_20250301T101500.000Z.tar.gz"),
        b"definitely not gzip",
    )
    .unwrap();
    std::fs::write(backup_dir.join("backup_20250301T101501.000Z.tar.gz"), b"").unwrap();

    let stops_before = h.engine.calls(EngineOp::Stop);
    for file in [
        "alpha/backup_20250301T101500.000Z.tar.gz",
        "alpha/backup_20250301T101501.000Z.tar.gz",
    ] {
        let id: BackupId = file.parse().unwrap();
        let err = h.backups.restore(&id, "alpha").await.unwrap_err();
        assert!(matches!(err, ManagerError::CorruptBackup { .. }), "{file}");
    }

    assert_eq!(h.engine.calls(EngineOp::Stop), stops_before);
    assert_eq!(snapshot(&alpha.data_path), before);
}

#[tokio::test]
async fn missing_backup_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());
    h.lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();

    let id: BackupId = "alpha/backup_20990101T000000.000Z.tar.gz".parse().unwrap();
    let err = h.backups.restore(&id, "alpha").await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound { .. }));
}

#[tokio::test]
async fn stop_failure_aborts_backup_and_keeps_instance_running() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&alpha.data_path);

    h.engine.fail_next(
        EngineOp::Stop,
        EngineError::Unavailable {
            reason: "daemon busy".to_string(),
        },
    );
    let err = h.backups.create("alpha", None).await.unwrap_err();
    match err {
        ManagerError::BackupFailed {
            instance,
            reason,
            resume_error,
        } => {
            assert_eq!(instance, "alpha");
            assert!(reason.contains("could not stop"), "{reason}");
            assert!(resume_error.is_none());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let row = h.registry.get(&alpha.id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Running);
    assert!(h.engine.container_state(&alpha.id).unwrap().is_running());
    assert_eq!(h.engine.calls(EngineOp::Start), 1);

    let listing = h.backups.list(Some("alpha")).await.unwrap();
    assert_eq!(listing.iter().count(), 0);
}

/// Passes validation, but unpacks `data` as a plain file.
fn archive_without_data_dir() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let contents = b"not a directory";
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "data", &contents[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn failed_swap_keeps_old_data_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let h = TestHarness::new(dir.path());

    let alpha = h
        .lifecycle
        .create("alpha", None, &HashMap::new())
        .await
        .unwrap();
    populate(&alpha.data_path);
    let before = snapshot(&alpha.data_path);

    let backup_dir = h.config.backup_dir("alpha");
    std::fs::create_dir_all(&backup_dir).unwrap();
    std::fs::write(
        backup_dir.join("backup_20250301T101500.000Z.tar.gz"),
        archive_without_data_dir(),
    )
    .unwrap();
    let id: BackupId = "alpha/backup_20250301T101500.000Z.tar.gz".parse().unwrap();

    let err = h.backups.restore(&id, "alpha").await.unwrap_err();
    match err {
        ManagerError::BackupFailed {
            instance,
            resume_error,
            ..
        } => {
            assert_eq!(instance, "alpha");
            assert!(resume_error.is_none());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(snapshot(&alpha.data_path), before);
    let row = h.registry.get(&alpha.id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Running);
    assert_eq!(h.engine.calls(EngineOp::Stop), 1);
    assert_eq!(h.engine.calls(EngineOp::Start), 2);

    let leftovers: Vec<String> = std::fs::read_dir(&h.config.data_root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
