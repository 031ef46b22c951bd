//! Gzip tar archives of an instance data directory.
//!
//! Archives are rooted at `data/`: every entry path starts with that
//! component, so unpacking into a staging directory yields `staging/data`.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType};

/// Top-level directory inside every archive.
pub(crate) const ARCHIVE_ROOT: &str = "data";

/// What validation found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArchiveSummary {
    pub entries: usize,
    pub unpacked_bytes: u64,
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Archive `source` into `dest`, returning the archive size.
///
/// Writes to `<dest>.partial` and renames on success, so a crash never
/// leaves a truncated file under the final name.
pub(crate) fn archive(source: &Path, dest: &Path) -> io::Result<u64> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("data directory {} does not exist", source.display()),
        ));
    }

    let partial = partial_path(dest);
    let result = write_archive(source, &partial).and_then(|()| std::fs::rename(&partial, dest));
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result?;

    Ok(std::fs::metadata(dest)?.len())
}

fn write_archive(source: &Path, out: &Path) -> io::Result<()> {
    let file = File::create(out)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(ARCHIVE_ROOT, source)?;
    let file = builder.into_inner()?.finish()?;
    file.sync_all()
}

/// Check that an archive is non-empty, well-formed, and only holds paths
/// under `data/`. Reads the whole stream, so gzip checksums are verified.
pub(crate) fn validate(path: &Path) -> Result<ArchiveSummary, String> {
    let mut file = File::open(path).map_err(|e| format!("cannot open archive: {}", e))?;
    let len = file
        .metadata()
        .map_err(|e| format!("cannot stat archive: {}", e))?
        .len();
    if len == 0 {
        return Err("archive is empty".to_string());
    }

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)
        .map_err(|_| "archive is too short to be gzip".to_string())?;
    if magic != [0x1f, 0x8b] {
        return Err("archive is not gzip-compressed".to_string());
    }
    let file = File::open(path).map_err(|e| format!("cannot reopen archive: {}", e))?;

    let mut archive = Archive::new(GzDecoder::new(file));
    let mut summary = ArchiveSummary {
        entries: 0,
        unpacked_bytes: 0,
    };

    let entries = archive
        .entries()
        .map_err(|e| format!("failed to read entries: {}", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("failed to read entry: {}", e))?;
        let entry_path = entry
            .path()
            .map_err(|e| format!("invalid entry path: {}", e))?
            .to_path_buf();
        check_entry_path(&entry_path)?;

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Symlink => {}
            EntryType::Link => {
                let target = entry
                    .link_name()
                    .map_err(|e| format!("invalid link in {}: {}", entry_path.display(), e))?
                    .ok_or_else(|| format!("hard link {} has no target", entry_path.display()))?;
                check_entry_path(&target)?;
            }
            other => {
                return Err(format!(
                    "unsupported entry type {:?} at {}",
                    other,
                    entry_path.display()
                ));
            }
        }

        summary.entries += 1;
        summary.unpacked_bytes += entry.size();
    }

    // Drain trailing bytes so the gzip footer checksum is verified.
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(|e| format!("archive is truncated: {}", e))?;

    if summary.entries == 0 {
        return Err("archive has no entries".to_string());
    }
    Ok(summary)
}

fn check_entry_path(path: &Path) -> Result<(), String> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == ARCHIVE_ROOT => {}
        _ => {
            return Err(format!(
                "entry {} is outside {}/",
                path.display(),
                ARCHIVE_ROOT
            ));
        }
    }
    if components.any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Err(format!("entry {} escapes the archive root", path.display()));
    }
    Ok(())
}

/// Unpack a validated archive into `staging`, returning `staging/data`.
pub(crate) fn unpack(path: &Path, staging: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(staging)?;
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    #[cfg(unix)]
    archive.set_unpack_xattrs(false);
    archive.unpack(staging)?;

    let root = staging.join(ARCHIVE_ROOT);
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive did not contain a {}/ directory", ARCHIVE_ROOT),
        ));
    }
    Ok(root)
}
