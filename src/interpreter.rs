use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, Utc};
use log::{info, warn};

use crate::attachments::sanitize_file_name;
use crate::backup;
use crate::contacts::ContactDirectory;
use crate::phone;

#[path = "interpreter/blob.rs"]
mod blob;
use blob::extract_readable_fragments;

/// Seconds between the Unix epoch and 2001-01-01, the epoch newer schema
/// generations count from.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;
/// Raw values above this are nanosecond counts rather than seconds.
const NANOSECOND_THRESHOLD: i64 = 1_000_000_000_000;
const EARLIEST_PLAUSIBLE_YEAR: i32 = 2005;
const UNKNOWN_ADDRESS: &str = "unknown";
const BOILERPLATE_PREFIX: &str = "RE :New Message";
const SNIPPET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Source row id, carried for logging only.
    pub id: i64,
    pub direction: Direction,
    pub timestamp: NaiveDateTime,
    pub address: String,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub source_path: PathBuf,
    pub suggested_file_name: String,
    pub description: String,
    pub archive_rel_path: String,
}

/// One message row as a loosely-typed field bag. Which fields are populated
/// depends on the source schema generation; every accessor below degrades
/// through a strategy list rather than assuming one shape.
#[derive(Debug, Default, Clone)]
pub struct RawMessage {
    pub rowid: i64,
    pub address: Option<String>,
    pub date: Option<i64>,
    pub service: Option<String>,
    pub is_from_me: Option<i64>,
    /// iMessage-generation flag word (madrid_flags).
    pub type_flags: Option<i64>,
    /// Pre-iMessage flags column.
    pub legacy_flags: Option<i64>,
    pub subject: Option<String>,
    pub text: Option<String>,
    /// Embedded recipient list blob (plist or archived attributed string).
    pub recipients_blob: Option<Vec<u8>>,
    pub sender_handle: Option<String>,
    pub room_name: Option<String>,
    pub handle_id: Option<i64>,
    pub has_attachments: bool,
}

/// Attachment row joined to a message, before interpretation.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub filename: Option<String>,
    pub transfer_name: Option<String>,
    pub metadata: Option<Vec<u8>>,
}

/// Prefetched lookup tables from the source database, so interpretation
/// itself stays a pure function over the row.
#[derive(Default)]
pub struct SourceContext {
    /// handle table rowid -> handle id.
    pub handles: HashMap<i64, String>,
    /// group-chat room name -> participant handles.
    pub rooms: HashMap<String, Vec<String>>,
    /// message rowid -> joined attachment rows.
    pub attachments: HashMap<i64, Vec<RawAttachment>>,
    pub backup_dir: PathBuf,
}

pub fn interpret(
    raw: &RawMessage,
    ctx: &SourceContext,
    contacts: &ContactDirectory,
) -> MessageRecord {
    let timestamp = resolve_timestamp(raw);
    let address = resolve_address(raw, ctx);
    let direction = resolve_direction(raw);
    let body = assemble_body(raw.subject.as_deref(), raw.text.as_deref());
    let attachments = resolve_attachments(raw, ctx, contacts, timestamp, &address, &body);
    MessageRecord {
        id: raw.rowid,
        direction,
        timestamp,
        address,
        body,
        attachments,
    }
}

fn resolve_timestamp(raw: &RawMessage) -> NaiveDateTime {
    let mut ticks = raw.date.unwrap_or(0);
    if ticks > NANOSECOND_THRESHOLD {
        ticks /= 1_000_000_000;
    }
    let uses_apple_epoch = raw.service.as_deref().map(|s| !s.is_empty()).unwrap_or(false);
    if uses_apple_epoch {
        ticks += APPLE_EPOCH_OFFSET;
    }
    let utc: DateTime<Utc> = DateTime::from_timestamp(ticks, 0).unwrap_or_default();
    let local = utc.with_timezone(&Local).naive_local();
    let year = local.year();
    if year < EARLIEST_PLAUSIBLE_YEAR || year > Local::now().year() {
        info!("row {}: implausible year {} after epoch resolution", raw.rowid, year);
    }
    local
}

fn resolve_address(raw: &RawMessage, ctx: &SourceContext) -> String {
    let resolved = raw
        .address
        .clone()
        .filter(|a| !a.is_empty())
        .or_else(|| recipients_from_blob(raw))
        .or_else(|| raw.sender_handle.clone().filter(|h| !h.is_empty()))
        .or_else(|| room_participants(raw, ctx))
        .or_else(|| {
            raw.handle_id
                .and_then(|id| ctx.handles.get(&id).cloned())
        })
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());
    let normalized = phone::normalize(&resolved);
    sender_first(normalized, raw.sender_handle.as_deref())
}

fn recipients_from_blob(raw: &RawMessage) -> Option<String> {
    let bytes = raw.recipients_blob.as_deref().filter(|b| !b.is_empty())?;
    let fragments: Vec<String> = extract_readable_fragments(bytes)
        .into_iter()
        .filter(|f| plausible_handle(f))
        .collect();
    if fragments.is_empty() {
        warn!("row {}: unrecognized recipient blob format", raw.rowid);
        return None;
    }
    Some(fragments.join(", "))
}

fn plausible_handle(fragment: &str) -> bool {
    fragment.contains('@') || fragment.chars().filter(|c| c.is_ascii_digit()).count() >= 7
}

fn room_participants(raw: &RawMessage, ctx: &SourceContext) -> Option<String> {
    let room = raw.room_name.as_deref().filter(|r| !r.is_empty())?;
    let members = ctx.rooms.get(room)?;
    if members.is_empty() {
        return None;
    }
    Some(members.join(", "))
}

/// Multi-party addresses list the explicit sender first when one is known.
fn sender_first(address: String, sender_handle: Option<&str>) -> String {
    let Some(sender) = sender_handle.filter(|h| !h.is_empty()) else {
        return address;
    };
    let mut parts: Vec<&str> = address.split(", ").collect();
    if parts.len() < 2 {
        return address;
    }
    let sender = phone::normalize(sender);
    if let Some(pos) = parts.iter().position(|p| **p == *sender) {
        if pos > 0 {
            let found = parts.remove(pos);
            parts.insert(0, found);
            return parts.join(", ");
        }
    }
    address
}

const SENT_TYPE_BIT: i64 = 0x4;
const SENT_LEGACY_BIT: i64 = 0x1;

fn resolve_direction(raw: &RawMessage) -> Direction {
    if let Some(from_me) = raw.is_from_me {
        return if from_me != 0 { Direction::Sent } else { Direction::Received };
    }
    if let Some(flags) = raw.type_flags {
        return if flags & SENT_TYPE_BIT != 0 { Direction::Sent } else { Direction::Received };
    }
    if let Some(flags) = raw.legacy_flags {
        return if flags & SENT_LEGACY_BIT != 0 { Direction::Sent } else { Direction::Received };
    }
    Direction::Unknown
}

fn assemble_body(subject: Option<&str>, text: Option<&str>) -> String {
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    let text = text.filter(|s| !s.trim().is_empty());
    let combined = match (subject, text) {
        (Some(s), Some(t)) => format!("{}\n{}", s, t),
        (Some(s), None) => s.to_string(),
        (None, Some(t)) => t.to_string(),
        (None, None) => String::new(),
    };
    // NBSP plus its double-encoded form both collapse to a plain space.
    let cleaned = combined.replace("\u{c2}\u{a0}", " ").replace('\u{a0}', " ");
    let lines: Vec<String> = cleaned
        .lines()
        .map(|line| {
            line.strip_prefix(BOILERPLATE_PREFIX)
                .map(|rest| rest.trim_start().to_string())
                .unwrap_or_else(|| line.to_string())
        })
        .collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

fn resolve_attachments(
    raw: &RawMessage,
    ctx: &SourceContext,
    contacts: &ContactDirectory,
    timestamp: NaiveDateTime,
    address: &str,
    body: &str,
) -> Vec<AttachmentRef> {
    if !raw.has_attachments {
        return Vec::new();
    }
    let Some(rows) = ctx.attachments.get(&raw.rowid) else {
        return Vec::new();
    };
    let sender_name = if raw.is_from_me == Some(1) {
        "me".to_string()
    } else {
        let sender = raw
            .sender_handle
            .as_deref()
            .map(phone::normalize)
            .unwrap_or_else(|| address.split(", ").next().unwrap_or(address).to_string());
        let resolved = contacts.resolve(&sender);
        if resolved.is_empty() { sender } else { resolved }
    };
    rows.iter()
        .filter_map(|row| {
            let logical = logical_name(row)?;
            let base = logical.rsplit('/').next().unwrap_or(&logical);
            let sanitized = sanitize_file_name(base);
            let archive_rel_path = format!(
                "Attachments/{}/{}-{}-{}",
                timestamp.format("%Y"),
                timestamp.format("%m-%d-%H:%M:%S"),
                address,
                sanitized
            );
            let snippet: String = body.chars().take(SNIPPET_LEN).collect();
            let description = format!(
                "{} sent {} by {}: {}",
                base,
                timestamp.format("%a %b %d %I:%M %p"),
                sender_name,
                snippet
            );
            Some(AttachmentRef {
                source_path: backup::attachment_source_path(&ctx.backup_dir, &logical),
                suggested_file_name: sanitized,
                description,
                archive_rel_path,
            })
        })
        .collect()
}

/// The on-device logical name for an attachment, preferring the explicit
/// filename, then the transfer name, then anything filename-shaped inside the
/// embedded metadata blob.
fn logical_name(row: &RawAttachment) -> Option<String> {
    if let Some(name) = row.filename.as_deref().filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }
    if let Some(name) = row.transfer_name.as_deref().filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }
    let bytes = row.metadata.as_deref()?;
    extract_readable_fragments(bytes)
        .into_iter()
        .find(|f| looks_like_file_name(f))
}

fn looks_like_file_name(fragment: &str) -> bool {
    let Some((stem, ext)) = fragment.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty()
        && (1..=4).contains(&ext.len())
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
        && !fragment.contains(' ')
}
