use chrono::NaiveDateTime;

use crate::contacts::ContactDirectory;
use crate::error::ExportError;
use crate::interpreter::{Direction, MessageRecord};
use crate::phone;

const MONTH_NAMES: &[&str] = &[
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Renders one record as its canonical archive form:
/// `<dir> <weekday mon day 12hrtime ampm> <address> <name>\t<text>\n`.
/// Continuation lines and attachment markers are tab-indented so a later
/// line-based reader can tell a new record from a wrapped one.
pub fn render_line(record: &MessageRecord, contacts: &ContactDirectory) -> String {
    let dir = match record.direction {
        Direction::Sent => '>',
        _ => '<',
    };
    let name = contacts.resolve(&record.address);
    let mut lines: Vec<String> = if record.body.is_empty() {
        Vec::new()
    } else {
        record.body.split('\n').map(str::to_string).collect()
    };
    for attachment in &record.attachments {
        lines.push(format!("<img src=\"{}\">", attachment.archive_rel_path));
    }
    let text = lines.join("\n\t");
    format!(
        "{} {} {} {}\t{}\n",
        dir,
        record.timestamp.format("%a %b %d %I:%M %p"),
        record.address,
        name,
        text
    )
}

/// Comparison-only projection of an archive record: the time and address
/// fields re-normalized to absorb two historical formatting bugs, the rest of
/// the record untouched. Never written back to disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedLineKey(String);

struct LineParts<'a> {
    dir: char,
    weekday: &'a str,
    month: &'a str,
    day: &'a str,
    time: String,
    ampm: &'a str,
    address: String,
    name: &'a str,
    text: &'a str,
}

pub fn starts_record(line: &str) -> bool {
    line.starts_with("> ") || line.starts_with("< ")
}

fn parse_parts(record: &str) -> Option<LineParts<'_>> {
    let record = record.trim_end_matches('\n');
    let (first, text) = match record.split_once('\t') {
        Some((head, text)) => (head, text),
        None => (record, ""),
    };
    let dir = first.chars().next()?;
    if dir != '>' && dir != '<' {
        return None;
    }
    let mut tokens = first.get(2..)?.splitn(7, ' ');
    let weekday = tokens.next()?;
    let month = tokens.next()?;
    let day = tokens.next()?;
    let time = tokens.next()?;
    let ampm = tokens.next()?;
    let address = tokens.next()?;
    let name = tokens.next().unwrap_or("");
    Some(LineParts {
        dir,
        weekday,
        month,
        day,
        time: repair_minute(time),
        ampm,
        address: phone::normalize(address),
        name,
        text,
    })
}

/// An old formatter bug wrote the minute field through the month renderer, so
/// `10:03` could land on disk as `10:Mar`. Repaired in memory only.
fn repair_minute(time: &str) -> String {
    let Some((hour, minute)) = time.split_once(':') else {
        return time.to_string();
    };
    match MONTH_NAMES.iter().position(|m| *m == minute) {
        Some(idx) => format!("{}:{:02}", hour, idx + 1),
        None => time.to_string(),
    }
}

pub fn normalized_key(record: &str) -> Option<NormalizedLineKey> {
    let parts = parse_parts(record)?;
    Some(NormalizedLineKey(format!(
        "{} {} {} {} {} {} {} {}\t{}",
        parts.dir,
        parts.weekday,
        parts.month,
        parts.day,
        parts.time,
        parts.ampm,
        parts.address,
        parts.name,
        parts.text
    )))
}

/// Parses a record's embedded date, borrowing the archive file's year to pin
/// down day-of-year edge cases such as leap days. The weekday token is
/// display-only and deliberately ignored.
pub fn parse_record_time(record: &str, file_year: i32) -> Result<NaiveDateTime, ExportError> {
    let parts = parse_parts(record).ok_or_else(|| {
        ExportError::Timestamp(format!("unparsable record: {:?}", first_line(record)))
    })?;
    let stamp = format!("{} {} {} {} {}", file_year, parts.month, parts.day, parts.time, parts.ampm);
    NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %I:%M %p")
        .map_err(|e| ExportError::Timestamp(format!("{:?}: {}", first_line(record), e)))
}

fn first_line(record: &str) -> &str {
    record.lines().next().unwrap_or("")
}
