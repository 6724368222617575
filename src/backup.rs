use std::fs;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::ExportError;

/// Well-known content-addressed names inside a device backup.
pub const MESSAGE_DB_HASH: &str = "3d0d7e5fb2ce288813306e4d4636395e047a3d28";
pub const ADDRESS_BOOK_HASH: &str = "31bb7ba8914766d4ba40d6dfb6113c8b614be442";

const MEDIA_DOMAIN: &str = "MediaDomain";

/// Picks the most recently modified backup directory that actually contains a
/// message store.
pub fn find_backup_dir(backups_root: &Path) -> Result<PathBuf, ExportError> {
    let entries = fs::read_dir(backups_root).map_err(|e| {
        ExportError::Source(format!("backup root {} unreadable: {}", backups_root.display(), e))
    })?;
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || hashed_file(&path, MESSAGE_DB_HASH).is_none() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if best.as_ref().map(|(ts, _)| modified > *ts).unwrap_or(true) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, path)| path).ok_or_else(|| {
        ExportError::Source(format!(
            "no usable backup under {}",
            backups_root.display()
        ))
    })
}

/// Resolves a content-addressed file inside the backup, tolerating both the
/// two-level hashed subdirectory layout and the older flat layout.
pub fn hashed_file(backup_dir: &Path, hash: &str) -> Option<PathBuf> {
    let nested = backup_dir.join(&hash[..2]).join(hash);
    if nested.exists() {
        return Some(nested);
    }
    let flat = backup_dir.join(hash);
    if flat.exists() {
        return Some(flat);
    }
    None
}

/// Computes the on-device backup name for an attachment's logical path:
/// SHA-1 over the domain-prefixed name, with any `~/` shorthand stripped.
pub fn attachment_hash(logical_name: &str) -> String {
    let trimmed = logical_name.strip_prefix("~/").unwrap_or(logical_name);
    let mut hasher = Sha1::new();
    hasher.update(format!("{}-{}", MEDIA_DOMAIN, trimmed).as_bytes());
    hex::encode(hasher.finalize())
}

/// The content-addressed path an attachment would occupy, whether or not it
/// still exists in the backup.
pub fn attachment_source_path(backup_dir: &Path, logical_name: &str) -> PathBuf {
    let hash = attachment_hash(logical_name);
    hashed_file(backup_dir, &hash).unwrap_or_else(|| backup_dir.join(hash))
}
