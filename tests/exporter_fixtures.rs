use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, Local, TimeZone};
use rusqlite::{params, Connection};
use sms_archive::backup::{attachment_hash, ADDRESS_BOOK_HASH, MESSAGE_DB_HASH};
use sms_archive::{run, ExportConfig};
use tempfile::tempdir;

fn local_epoch(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
    Local
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("local time")
        .timestamp()
}

fn create_backup_dir(root: &Path) -> PathBuf {
    let backup = root.join("backup");
    fs::create_dir_all(&backup).expect("backup dir");
    backup
}

fn create_message_db(backup: &Path) -> Connection {
    let conn = Connection::open(backup.join(MESSAGE_DB_HASH)).expect("message db");
    conn.execute_batch(
        r#"
        CREATE TABLE message (
          ROWID INTEGER PRIMARY KEY,
          address TEXT,
          date INTEGER,
          is_from_me INTEGER,
          subject TEXT,
          text TEXT,
          handle_id INTEGER,
          cache_has_attachments INTEGER
        );
        CREATE TABLE handle (
          ROWID INTEGER PRIMARY KEY,
          id TEXT
        );
        CREATE TABLE attachment (
          ROWID INTEGER PRIMARY KEY,
          filename TEXT,
          transfer_name TEXT,
          user_info BLOB
        );
        CREATE TABLE message_attachment_join (
          message_id INTEGER,
          attachment_id INTEGER
        );
        "#,
    )
    .expect("schema");
    conn
}

fn create_contacts_db(backup: &Path) {
    let conn = Connection::open(backup.join(ADDRESS_BOOK_HASH)).expect("contacts db");
    conn.execute_batch(
        r#"
        CREATE TABLE ABPerson (
          ROWID INTEGER PRIMARY KEY,
          First TEXT,
          Last TEXT,
          Organization TEXT
        );
        CREATE TABLE ABMultiValue (
          record_id INTEGER,
          property INTEGER,
          value TEXT
        );
        "#,
    )
    .expect("schema");
    conn.execute(
        "INSERT INTO ABPerson (ROWID, First, Last, Organization) VALUES (1, 'Ada', 'Lovelace', NULL);",
        [],
    )
    .expect("person");
    conn.execute(
        "INSERT INTO ABMultiValue (record_id, property, value) VALUES (1, 3, '+1 (415) 555-1212');",
        [],
    )
    .expect("phone");
}

fn create_flat_contacts_db(backup: &Path) {
    let conn = Connection::open(backup.join(ADDRESS_BOOK_HASH)).expect("contacts db");
    conn.execute_batch(
        r#"
        CREATE TABLE contacts (
          first TEXT,
          last TEXT,
          organization TEXT,
          phone TEXT
        );
        "#,
    )
    .expect("schema");
    conn.execute(
        "INSERT INTO contacts (first, last, organization, phone) VALUES ('Ada', 'Lovelace', NULL, '+1 (415) 555-1212');",
        [],
    )
    .expect("contact");
}

#[test]
fn end_to_end_sent_message_without_contacts() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 1, 'hi');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    let stats = run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    assert_eq!(stats.messages, 1);
    assert_eq!(stats.files_written, 1);

    let content = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");
    assert_eq!(content, "> Sun Mar 01 10:00 AM 4155551212 \thi\n");
}

#[test]
fn end_to_end_resolves_contact_names() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    create_contacts_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 0, 'tea?');",
        params!["+14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    run(&ExportConfig::new(backup, out.clone(), false)).expect("run");

    let content = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");
    assert_eq!(content, "< Sun Mar 01 10:00 AM 4155551212 Ada Lovelace\ttea?\n");
}

#[test]
fn flat_contacts_table_resolves_names() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    create_flat_contacts_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 0, 'tea?');",
        params!["+14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    run(&ExportConfig::new(backup, out.clone(), false)).expect("run");

    let content = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");
    assert_eq!(content, "< Sun Mar 01 10:00 AM 4155551212 Ada Lovelace\ttea?\n");
}

#[test]
fn repeat_runs_add_nothing() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 1, 'hi');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    let config = ExportConfig::new(backup, out.clone(), false);
    run(&config).expect("first run");
    let after_first = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");

    let stats = run(&config).expect("second run");
    assert_eq!(stats.files_written, 0);
    assert_eq!(stats.files_unchanged, 1);
    assert_eq!(stats.lines_new, 0);
    assert_eq!(
        fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive"),
        after_first
    );
}

#[test]
fn stale_month_growth_is_suppressed_after_first_write() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 1, 'hi');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    let config = ExportConfig::new(backup.clone(), out.clone(), false);
    run(&config).expect("backfill run");
    let archived = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");

    // A late arrival in an already-archived old month stays out of the file.
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (2, ?1, ?2, 1, 'late insert');",
        params!["14155551212", local_epoch(2020, 3, 2, 11, 0)],
    )
    .expect("row");
    let stats = run(&config).expect("second run");
    assert_eq!(stats.files_suppressed, 1);
    assert_eq!(
        fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive"),
        archived
    );
}

#[test]
fn handle_rowid_fallback_resolves_address() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    conn.execute("INSERT INTO handle (ROWID, id) VALUES (5, '+16285550000');", [])
        .expect("handle");
    conn.execute(
        "INSERT INTO message (ROWID, date, is_from_me, text, handle_id) VALUES (1, ?1, 0, 'hello', 5);",
        params![local_epoch(2020, 3, 1, 9, 30)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    assert!(out.join("2020-03.6285550000.txt").exists());
}

#[test]
fn legacy_flags_schema_exports() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = Connection::open(backup.join(MESSAGE_DB_HASH)).expect("message db");
    conn.execute_batch(
        r#"
        CREATE TABLE message (
          ROWID INTEGER PRIMARY KEY,
          address TEXT,
          date INTEGER,
          flags INTEGER,
          text TEXT
        );
        "#,
    )
    .expect("schema");
    conn.execute(
        "INSERT INTO message (ROWID, address, date, flags, text) VALUES (1, ?1, ?2, 3, 'old sent');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("sent row");
    conn.execute(
        "INSERT INTO message (ROWID, address, date, flags, text) VALUES (2, ?1, ?2, 2, 'old received');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 5)],
    )
    .expect("received row");

    let out = tmp.path().join("out");
    run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    let content = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");
    assert!(content.contains("> Sun Mar 01 10:00 AM 4155551212 \told sent"));
    assert!(content.contains("< Sun Mar 01 10:05 AM 4155551212 \told received"));
}

#[test]
fn attachments_copied_into_year_segmented_tree() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    let logical = "~/Library/SMS/Attachments/ab/cd/IMG_0007.JPG";
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text, cache_has_attachments) \
         VALUES (1, ?1, ?2, 1, 'photo for you', 1);",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");
    conn.execute(
        "INSERT INTO attachment (ROWID, filename) VALUES (9, ?1);",
        params![logical],
    )
    .expect("attachment");
    conn.execute(
        "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (1, 9);",
        [],
    )
    .expect("join");
    fs::write(backup.join(attachment_hash(logical)), b"jpeg bytes").expect("payload");

    let out = tmp.path().join("out");
    let stats = run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    assert_eq!(stats.attachments_copied, 1);

    let copied = out
        .join("Attachments")
        .join("2020")
        .join("03-01-10:00:00-4155551212-img_0007.jpg");
    assert_eq!(fs::read(&copied).expect("copied bytes"), b"jpeg bytes");

    let content = fs::read_to_string(out.join("2020-03.4155551212.txt")).expect("archive");
    assert!(content
        .contains("\tphoto for you\n\t<img src=\"Attachments/2020/03-01-10:00:00-4155551212-img_0007.jpg\">"));
}

#[test]
fn old_missing_attachment_is_silently_skipped() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    let when = Local::now() - Duration::days(20);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text, cache_has_attachments) \
         VALUES (1, ?1, ?2, 1, 'lost photo', 1);",
        params!["14155551212", when.timestamp()],
    )
    .expect("row");
    conn.execute(
        "INSERT INTO attachment (ROWID, filename) VALUES (9, '~/Library/SMS/Attachments/zz/nope.jpg');",
        [],
    )
    .expect("attachment");
    conn.execute(
        "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (1, 9);",
        [],
    )
    .expect("join");

    let out = tmp.path().join("out");
    let stats = run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    assert_eq!(stats.attachments_expired, 1);
    assert_eq!(stats.attachments_missing, 0);
    assert!(!out.join("Attachments").exists());
}

#[test]
fn recent_missing_attachment_warns_but_continues() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    let when = Local::now() - Duration::days(2);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text, cache_has_attachments) \
         VALUES (1, ?1, ?2, 1, 'fresh photo', 1);",
        params!["14155551212", when.timestamp()],
    )
    .expect("row");
    conn.execute(
        "INSERT INTO attachment (ROWID, filename) VALUES (9, '~/Library/SMS/Attachments/zz/nope.jpg');",
        [],
    )
    .expect("attachment");
    conn.execute(
        "INSERT INTO message_attachment_join (message_id, attachment_id) VALUES (1, 9);",
        [],
    )
    .expect("join");

    let out = tmp.path().join("out");
    let stats = run(&ExportConfig::new(backup, out.clone(), false)).expect("run");
    assert_eq!(stats.attachments_missing, 1);
    assert_eq!(stats.messages, 1);
}

#[test]
fn dry_run_touches_nothing() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let conn = create_message_db(&backup);
    conn.execute(
        "INSERT INTO message (ROWID, address, date, is_from_me, text) VALUES (1, ?1, ?2, 1, 'hi');",
        params!["14155551212", local_epoch(2020, 3, 1, 10, 0)],
    )
    .expect("row");

    let out = tmp.path().join("out");
    let stats = run(&ExportConfig::new(backup, out.clone(), true)).expect("run");
    assert_eq!(stats.files_written, 1);
    assert!(!out.exists());
}

#[test]
fn missing_message_store_is_fatal() {
    let tmp = tempdir().expect("temp");
    let backup = create_backup_dir(tmp.path());
    let out = tmp.path().join("out");
    assert!(run(&ExportConfig::new(backup, out, false)).is_err());
}
