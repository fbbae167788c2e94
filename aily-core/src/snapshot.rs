//! Periodic gzip snapshots of the database file, with retention pruning.
//!
//! Snapshots are written to a temp file in the backup directory and
//! renamed into place, so a crash mid-write never leaves a partial
//! backup under the final name.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// Write a compressed snapshot of `db_path` into `backup_dir`. Returns
/// the snapshot path.
pub fn write_snapshot(db_path: &Path, backup_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir)?;

    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let final_path = backup_dir.join(format!("aily-{stamp}.db.gz"));
    let tmp_path = backup_dir.join(format!(".aily-{stamp}.db.gz.tmp"));

    {
        let mut reader = BufReader::new(File::open(db_path)?);
        let writer = BufWriter::new(File::create(&tmp_path)?);
        let mut encoder = GzEncoder::new(writer, Compression::fast());
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            encoder.write_all(&buffer[..read])?;
        }
        encoder.finish()?.flush()?;
    }

    std::fs::rename(&tmp_path, &final_path)?;
    tracing::info!(target = "aily::snapshot", path = %final_path.display(), "snapshot written");
    Ok(final_path)
}

/// Delete snapshots older than the retention window. Returns how many
/// were removed.
pub fn prune_snapshots(backup_dir: &Path, retain: Duration) -> Result<usize> {
    let Ok(entries) = std::fs::read_dir(backup_dir) else {
        return Ok(0);
    };
    let cutoff = SystemTime::now()
        .checked_sub(retain)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("aily-") || !name.ends_with(".db.gz") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if modified < cutoff {
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
                tracing::debug!(target = "aily::snapshot", path = %path.display(), "pruned snapshot");
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::{prune_snapshots, write_snapshot};

    #[test]
    fn snapshot_round_trips_through_gzip() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("aily.db");
        std::fs::write(&db, b"pretend database bytes").unwrap();

        let backup_dir = dir.path().join("backups");
        let snapshot = write_snapshot(&db, &backup_dir).unwrap();
        assert!(snapshot.exists());

        let mut decoder = GzDecoder::new(std::fs::File::open(&snapshot).unwrap());
        let mut restored = Vec::new();
        decoder.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, b"pretend database bytes");

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&backup_dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn prune_removes_only_old_snapshots() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("aily.db");
        std::fs::write(&db, b"data").unwrap();
        let backup_dir = dir.path().join("backups");
        write_snapshot(&db, &backup_dir).unwrap();

        // Everything is fresh: zero-retention prunes it, generous
        // retention keeps it.
        assert_eq!(prune_snapshots(&backup_dir, Duration::from_secs(3_600)).unwrap(), 0);
        assert_eq!(prune_snapshots(&backup_dir, Duration::ZERO).unwrap(), 1);
    }

    #[test]
    fn prune_on_missing_dir_is_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            prune_snapshots(&dir.path().join("nope"), Duration::ZERO).unwrap(),
            0
        );
    }
}
