use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{Datelike, NaiveDateTime};
use log::{debug, info};
use tempfile::NamedTempFile;

use crate::error::ExportError;
use crate::format::{normalized_key, parse_record_time, starts_record};

#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub now: NaiveDateTime,
    pub dry_run: bool,
    /// Archive months older than this are read-only once they exist on disk.
    pub stale_after_months: i32,
}

impl MergePolicy {
    pub fn new(now: NaiveDateTime, dry_run: bool) -> Self {
        MergePolicy { now, dry_run, stale_after_months: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Every candidate was already archived.
    Unchanged { candidates: usize },
    /// New lines exist but the file is a stale month already on disk; the
    /// write is refused rather than risk polluting settled history.
    Suppressed { new: usize },
    Write { content: String, new: usize, total: usize },
}

/// The merge pipeline as a pure function: old content plus candidate lines in,
/// new content plus a change report out. All disk I/O stays in `merge_file`.
pub fn reconcile(
    existing: Option<&str>,
    candidates: &[String],
    file_year: i32,
    file_month: u32,
    policy: &MergePolicy,
) -> Result<MergeOutcome, ExportError> {
    let existing_records = match existing {
        Some(content) => split_records(content),
        None => Vec::new(),
    };
    let mut seen: HashSet<_> = existing_records
        .iter()
        .filter_map(|record| normalized_key(record))
        .collect();

    let mut new_records: Vec<String> = Vec::new();
    for candidate in candidates {
        let record = candidate.trim_end_matches('\n').to_string();
        match normalized_key(&record) {
            Some(key) => {
                if seen.insert(key) {
                    new_records.push(record);
                }
            }
            None => new_records.push(record),
        }
    }
    if new_records.is_empty() {
        return Ok(MergeOutcome::Unchanged { candidates: candidates.len() });
    }

    let month_age = (policy.now.year() * 12 + policy.now.month0() as i32)
        - (file_year * 12 + file_month as i32 - 1);
    if month_age > policy.stale_after_months && existing.is_some() {
        return Ok(MergeOutcome::Suppressed { new: new_records.len() });
    }

    let new_count = new_records.len();
    let mut records: Vec<(NaiveDateTime, String)> = Vec::with_capacity(
        existing_records.len() + new_count,
    );
    for record in existing_records.into_iter().chain(new_records) {
        let ts = parse_record_time(&record, file_year)?;
        records.push((ts, record));
    }
    records.sort_by_key(|(ts, _)| *ts);
    let total = records.len();
    let mut content = records
        .into_iter()
        .map(|(_, record)| record)
        .collect::<Vec<_>>()
        .join("\n");
    content.push('\n');
    Ok(MergeOutcome::Write { content, new: new_count, total })
}

/// Splits archive content into logical records: a line starting with the
/// direction marker opens a record, anything else continues the previous one.
pub fn split_records(content: &str) -> Vec<String> {
    let mut records: Vec<String> = Vec::new();
    for line in content.lines() {
        if starts_record(line) || records.is_empty() {
            records.push(line.to_string());
        } else if let Some(last) = records.last_mut() {
            last.push('\n');
            last.push_str(line);
        }
    }
    records
}

/// Year and month encoded in an archive file name (`YYYY-MM.<address>.txt`).
pub fn parse_file_stamp(path: &Path) -> Result<(i32, u32), ExportError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExportError::Archive(format!("bad archive path {}", path.display())))?;
    let stamp = name.split('.').next().unwrap_or("");
    let parsed = stamp.split_once('-').and_then(|(y, m)| {
        let year: i32 = y.parse().ok()?;
        let month: u32 = m.parse().ok()?;
        (1..=12).contains(&month).then_some((year, month))
    });
    parsed.ok_or_else(|| ExportError::Archive(format!("unparsable archive file name {}", name)))
}

pub fn merge_file(
    path: &Path,
    candidates: &[String],
    policy: &MergePolicy,
) -> Result<MergeOutcome, ExportError> {
    let (year, month) = parse_file_stamp(path)?;
    let existing = if path.exists() {
        Some(fs::read_to_string(path).map_err(|e| {
            ExportError::Archive(format!("read {} failed: {}", path.display(), e))
        })?)
    } else {
        None
    };
    let outcome = reconcile(existing.as_deref(), candidates, year, month, policy)?;
    match &outcome {
        MergeOutcome::Unchanged { candidates } => {
            debug!("{}: unchanged ({} candidates)", path.display(), candidates);
        }
        MergeOutcome::Suppressed { new } => {
            info!(
                "{}: would write {} new lines, but suppressed (stale month)",
                path.display(),
                new
            );
        }
        MergeOutcome::Write { content, new, total } => {
            if policy.dry_run {
                info!("{}: dry run, skipping write of {} new ({} total)", path.display(), new, total);
            } else {
                write_atomic(path, content)?;
                info!("{}: wrote {} new lines ({} total)", path.display(), new, total);
            }
        }
    }
    Ok(outcome)
}

fn write_atomic(path: &Path, content: &str) -> Result<(), ExportError> {
    let parent = path
        .parent()
        .ok_or_else(|| ExportError::Archive(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| ExportError::Archive(format!("archive dir failed: {}", e)))?;
    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| ExportError::Archive(format!("archive temp failed: {}", e)))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| ExportError::Archive(format!("archive write failed: {}", e)))?;
    temp.persist(path)
        .map_err(|e| ExportError::Archive(format!("archive persist failed: {}", e)))?;
    Ok(())
}
