use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Duration, Local};
use log::{error, info, warn};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use crate::attachments::{self, MaterializeOutcome};
use crate::backup::{self, ADDRESS_BOOK_HASH, MESSAGE_DB_HASH};
use crate::contacts::ContactDirectory;
use crate::error::ExportError;
use crate::format::render_line;
use crate::interpreter::{self, RawAttachment, RawMessage, SourceContext};
use crate::merge::{merge_file, MergeOutcome, MergePolicy};

const DEFAULT_ATTACHMENT_GRACE_DAYS: i64 = 15;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub backup_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    /// How long a missing attachment source stays warning-worthy.
    pub attachment_grace: Duration,
}

impl ExportConfig {
    pub fn new(backup_dir: PathBuf, output_dir: PathBuf, dry_run: bool) -> Self {
        ExportConfig {
            backup_dir,
            output_dir,
            dry_run,
            attachment_grace: Duration::days(DEFAULT_ATTACHMENT_GRACE_DAYS),
        }
    }

    /// Default locations under the user's home directory. The backup root is
    /// searched for the most recent usable backup.
    pub fn from_home(home: &Path, output_dir: Option<PathBuf>, dry_run: bool) -> Result<Self, ExportError> {
        let backups_root = home
            .join("Library")
            .join("Application Support")
            .join("MobileSync")
            .join("Backup");
        let backup_dir = backup::find_backup_dir(&backups_root)?;
        let output_dir =
            output_dir.unwrap_or_else(|| home.join("Documents").join("SMSArchive"));
        Ok(ExportConfig::new(backup_dir, output_dir, dry_run))
    }
}

#[derive(Debug, Default, Serialize)]
pub struct RunStats {
    pub messages: u64,
    pub files_written: u64,
    pub files_unchanged: u64,
    pub files_suppressed: u64,
    pub files_failed: u64,
    pub lines_new: u64,
    pub attachments_copied: u64,
    pub attachments_missing: u64,
    pub attachments_expired: u64,
}

pub fn run(config: &ExportConfig) -> Result<RunStats, ExportError> {
    let message_db = backup::hashed_file(&config.backup_dir, MESSAGE_DB_HASH).ok_or_else(|| {
        ExportError::Source(format!(
            "no message store in backup {}",
            config.backup_dir.display()
        ))
    })?;
    let source = Connection::open_with_flags(&message_db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| ExportError::Source(format!("open {} failed: {}", message_db.display(), e)))?;

    let contacts = load_contacts(&config.backup_dir)?;
    let ctx = build_context(&source, config.backup_dir.clone())?;

    let mut stats = RunStats::default();
    let mut batches: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut created_dirs: HashSet<PathBuf> = HashSet::new();
    let now = Local::now().naive_local();

    for raw in fetch_messages(&source, &ctx)? {
        let record = interpreter::interpret(&raw, &ctx, &contacts);
        stats.messages += 1;

        for attachment in &record.attachments {
            let outcome = attachments::materialize(
                &record,
                attachment,
                &config.output_dir,
                config.attachment_grace,
                now,
                config.dry_run,
                &mut created_dirs,
            )?;
            match outcome {
                MaterializeOutcome::Copied => stats.attachments_copied += 1,
                MaterializeOutcome::RecentMissing => stats.attachments_missing += 1,
                MaterializeOutcome::ExpiredMissing => stats.attachments_expired += 1,
                MaterializeOutcome::AlreadyPresent => {}
            }
        }

        let file_name = format!(
            "{}.{}.txt",
            record.timestamp.format("%Y-%m"),
            record.address
        );
        batches
            .entry(file_name)
            .or_default()
            .push(render_line(&record, &contacts));
    }

    let policy = MergePolicy::new(now, config.dry_run);
    for (file_name, lines) in &batches {
        let path = config.output_dir.join(file_name);
        match merge_file(&path, lines, &policy) {
            Ok(MergeOutcome::Write { new, .. }) => {
                stats.files_written += 1;
                stats.lines_new += new as u64;
            }
            Ok(MergeOutcome::Unchanged { .. }) => stats.files_unchanged += 1,
            Ok(MergeOutcome::Suppressed { .. }) => stats.files_suppressed += 1,
            // A record that cannot be re-dated poisons only its own file.
            Err(ExportError::Timestamp(msg)) => {
                error!("{}: skipped, {}", path.display(), msg);
                stats.files_failed += 1;
            }
            Err(err) => return Err(err),
        }
    }

    info!(
        "export complete: {}",
        serde_json::to_string(&stats).unwrap_or_default()
    );
    Ok(stats)
}

fn load_contacts(backup_dir: &Path) -> Result<ContactDirectory, ExportError> {
    let mut sources: Vec<PathBuf> = Vec::new();
    if let Some(address_book) = backup::hashed_file(backup_dir, ADDRESS_BOOK_HASH) {
        sources.push(address_book);
    }
    if sources.is_empty() {
        warn!("no contacts database in backup, addresses stay unresolved");
        return Ok(ContactDirectory::empty());
    }
    let contacts = ContactDirectory::load(&sources)?;
    info!("loaded {} contact entries", contacts.len());
    Ok(contacts)
}

fn build_context(source: &Connection, backup_dir: PathBuf) -> Result<SourceContext, ExportError> {
    let mut ctx = SourceContext {
        backup_dir,
        ..Default::default()
    };

    if table_exists(source, "handle")? {
        let mut stmt = source.prepare("SELECT ROWID, id FROM handle;")?;
        let rows = stmt.query_map([], |row| {
            let rowid: i64 = row.get(0)?;
            let id: String = row.get(1)?;
            Ok((rowid, id))
        })?;
        for row in rows {
            let (rowid, id) = row?;
            ctx.handles.insert(rowid, id);
        }
    }

    if table_exists(source, "chat")?
        && table_exists(source, "chat_handle_join")?
        && column_exists(source, "chat", "room_name")?
    {
        let mut stmt = source.prepare(
            "SELECT chat.room_name, handle.id
             FROM chat
             JOIN chat_handle_join ON chat_handle_join.chat_id = chat.ROWID
             JOIN handle ON handle.ROWID = chat_handle_join.handle_id
             WHERE chat.room_name IS NOT NULL;",
        )?;
        let rows = stmt.query_map([], |row| {
            let room: String = row.get(0)?;
            let handle: String = row.get(1)?;
            Ok((room, handle))
        })?;
        for row in rows {
            let (room, handle) = row?;
            ctx.rooms.entry(room).or_default().push(handle);
        }
    }

    if table_exists(source, "attachment")? && table_exists(source, "message_attachment_join")? {
        let file_col = pick_column(source, "attachment", &["filename", "file_name"])?;
        let transfer_col = pick_column(source, "attachment", &["transfer_name", "transferName"])?;
        let meta_col = pick_column(source, "attachment", &["user_info", "attribution_info"])?;
        let mut stmt = source.prepare(&format!(
            "SELECT j.message_id, {file}, {transfer}, {meta}
             FROM message_attachment_join j
             JOIN attachment a ON a.ROWID = j.attachment_id;",
            file = file_col.as_deref().map(|c| format!("a.{c}")).unwrap_or_else(|| "NULL".into()),
            transfer = transfer_col.as_deref().map(|c| format!("a.{c}")).unwrap_or_else(|| "NULL".into()),
            meta = meta_col.as_deref().map(|c| format!("a.{c}")).unwrap_or_else(|| "NULL".into()),
        ))?;
        let rows = stmt.query_map([], |row| {
            let message_id: i64 = row.get(0)?;
            let filename: Option<String> = row.get(1)?;
            let transfer_name: Option<String> = row.get(2)?;
            let metadata: Option<Vec<u8>> = row.get(3)?;
            Ok((message_id, RawAttachment { filename, transfer_name, metadata }))
        })?;
        for row in rows {
            let (message_id, attachment) = row?;
            ctx.attachments.entry(message_id).or_default().push(attachment);
        }
    }

    Ok(ctx)
}

fn fetch_messages(
    source: &Connection,
    ctx: &SourceContext,
) -> Result<Vec<RawMessage>, ExportError> {
    if !table_exists(source, "message")? {
        return Err(ExportError::Source("source has no message table".to_string()));
    }
    let address_col = pick_column(source, "message", &["address", "account"])?;
    let date_col = pick_column(source, "message", &["date", "date_sent"])?;
    let service_col = pick_column(source, "message", &["service"])?;
    let from_me_col = pick_column(source, "message", &["is_from_me"])?;
    let type_flags_col = pick_column(source, "message", &["madrid_flags"])?;
    let legacy_flags_col = pick_column(source, "message", &["flags"])?;
    let subject_col = pick_column(source, "message", &["subject"])?;
    let text_col = pick_column(source, "message", &["text", "body"])?;
    let recipients_col = pick_column(source, "message", &["madrid_recipients", "recipients"])?;
    let sender_col = pick_column(source, "message", &["madrid_handle", "sender"])?;
    let room_col = pick_column(source, "message", &["madrid_roomname", "cache_roomnames"])?;
    let handle_col = pick_column(source, "message", &["handle_id"])?;
    let flagged_col = pick_column(source, "message", &["cache_has_attachments", "has_attachments"])?;

    let mut stmt = source.prepare(&format!(
        "SELECT ROWID, {address}, {date}, {service}, {from_me}, {type_flags}, {legacy_flags}, \
                {subject}, {text}, {recipients}, {sender}, {room}, {handle}, {flagged} \
         FROM message ORDER BY ROWID;",
        address = address_col.as_deref().unwrap_or("NULL"),
        date = date_col.as_deref().unwrap_or("NULL"),
        service = service_col.as_deref().unwrap_or("NULL"),
        from_me = from_me_col.as_deref().unwrap_or("NULL"),
        type_flags = type_flags_col.as_deref().unwrap_or("NULL"),
        legacy_flags = legacy_flags_col.as_deref().unwrap_or("NULL"),
        subject = subject_col.as_deref().unwrap_or("NULL"),
        text = text_col.as_deref().unwrap_or("NULL"),
        recipients = recipients_col.as_deref().unwrap_or("NULL"),
        sender = sender_col.as_deref().unwrap_or("NULL"),
        room = room_col.as_deref().unwrap_or("NULL"),
        handle = handle_col.as_deref().unwrap_or("NULL"),
        flagged = flagged_col.as_deref().unwrap_or("NULL"),
    ))?;
    let rows = stmt.query_map([], |row| {
        let rowid: i64 = row.get(0)?;
        let address: Option<String> = row.get(1)?;
        let date: Option<i64> = row.get(2)?;
        let service: Option<String> = row.get(3)?;
        let is_from_me: Option<i64> = row.get(4)?;
        let type_flags: Option<i64> = row.get(5)?;
        let legacy_flags: Option<i64> = row.get(6)?;
        let subject: Option<String> = row.get(7)?;
        let text: Option<String> = row.get(8)?;
        let recipients_blob: Option<Vec<u8>> = row.get(9)?;
        let sender_handle: Option<String> = row.get(10)?;
        let room_name: Option<String> = row.get(11)?;
        let handle_id: Option<i64> = row.get(12)?;
        let flagged: Option<i64> = row.get(13)?;
        Ok(RawMessage {
            rowid,
            address,
            date,
            service,
            is_from_me,
            type_flags,
            legacy_flags,
            subject,
            text,
            recipients_blob,
            sender_handle,
            room_name,
            handle_id,
            has_attachments: flagged.map(|v| v != 0).unwrap_or(false),
        })
    })?;
    let mut messages = Vec::new();
    for row in rows {
        let mut raw = row?;
        if !raw.has_attachments && ctx.attachments.contains_key(&raw.rowid) {
            raw.has_attachments = true;
        }
        messages.push(raw);
    }
    Ok(messages)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, ExportError> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1;",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, ExportError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn pick_column(
    conn: &Connection,
    table: &str,
    preferred: &[&str],
) -> Result<Option<String>, ExportError> {
    for col in preferred {
        if column_exists(conn, table, col)? {
            return Ok(Some((*col).to_string()));
        }
    }
    Ok(None)
}
