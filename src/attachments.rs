use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::ExportError;
use crate::interpreter::{AttachmentRef, MessageRecord};

const EXTENSION_ALLOWLIST: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "tif", "tiff", "heic", "mov", "mp4", "m4v", "m4a", "amr",
    "caf", "vcf", "txt", "pdf",
];
const DEFAULT_EXTENSION: &str = "jpg";

/// Archive-side file name: lowercased, restricted charset, exactly one
/// extension drawn from the allow-list.
pub fn sanitize_file_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | ':' | '+' | '_' | '-'))
        .collect();
    let (stem, ext) = match lowered.rsplit_once('.') {
        Some((stem, ext)) if EXTENSION_ALLOWLIST.contains(&ext) => (stem.to_string(), ext),
        Some((stem, ext)) => (format!("{}{}", stem, ext), DEFAULT_EXTENSION),
        None => (lowered.clone(), DEFAULT_EXTENSION),
    };
    let stem: String = stem.chars().filter(|c| *c != '.').collect();
    format!("{}.{}", stem, ext)
}

/// Copies one attachment from its content-addressed source into the archive
/// tree. Existing destinations are never overwritten. A missing source is a
/// warning while the record is recent and silence once it has aged past the
/// grace window (the backup medium prunes old attachments).
pub fn materialize(
    record: &MessageRecord,
    attachment: &AttachmentRef,
    output_dir: &Path,
    grace: Duration,
    now: NaiveDateTime,
    dry_run: bool,
    created_dirs: &mut HashSet<std::path::PathBuf>,
) -> Result<MaterializeOutcome, ExportError> {
    let dest = output_dir.join(&attachment.archive_rel_path);
    if dest.exists() {
        return Ok(MaterializeOutcome::AlreadyPresent);
    }
    let bytes = match fs::read(&attachment.source_path) {
        Ok(bytes) => bytes,
        Err(_) => {
            if now - record.timestamp > grace {
                debug!(
                    "row {}: attachment {} gone from backup, past grace window",
                    record.id,
                    attachment.source_path.display()
                );
                return Ok(MaterializeOutcome::ExpiredMissing);
            }
            warn!(
                "row {}: attachment missing from backup: {} ({})",
                record.id,
                attachment.source_path.display(),
                attachment.description
            );
            return Ok(MaterializeOutcome::RecentMissing);
        }
    };
    if dry_run {
        return Ok(MaterializeOutcome::Copied);
    }
    let parent = dest
        .parent()
        .ok_or_else(|| ExportError::Archive(format!("no parent for {}", dest.display())))?;
    if !created_dirs.contains(parent) {
        fs::create_dir_all(parent)
            .map_err(|e| ExportError::Archive(format!("attachment dir failed: {}", e)))?;
        created_dirs.insert(parent.to_path_buf());
    }
    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| ExportError::Archive(format!("attachment temp failed: {}", e)))?;
    temp.write_all(&bytes)
        .map_err(|e| ExportError::Archive(format!("attachment write failed: {}", e)))?;
    temp.persist(&dest)
        .map_err(|e| ExportError::Archive(format!("attachment persist failed: {}", e)))?;
    Ok(MaterializeOutcome::Copied)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Copied,
    AlreadyPresent,
    RecentMissing,
    ExpiredMissing,
}
