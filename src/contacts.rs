use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::error::ExportError;
use crate::exporter::{pick_column, table_exists};
use crate::phone;

const PHONE_PROPERTY: i64 = 3;

/// Lookup table from normalized phone/handle to display name. Built once per
/// run from every discovered contacts source, read-only afterwards.
pub struct ContactDirectory {
    names: HashMap<String, String>,
}

impl ContactDirectory {
    pub fn empty() -> Self {
        ContactDirectory { names: HashMap::new() }
    }

    /// Loads every source in discovery order. Later sources overwrite earlier
    /// entries for the same number.
    pub fn load(sources: &[impl AsRef<Path>]) -> Result<Self, ExportError> {
        let mut dir = ContactDirectory::empty();
        for source in sources {
            let source = source.as_ref();
            let conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(|e| {
                    ExportError::Contacts(format!("open {} failed: {}", source.display(), e))
                })?;
            let loaded = dir.load_source(&conn)?;
            if loaded == 0 {
                return Err(ExportError::Contacts(format!(
                    "no usable contact entries in {}",
                    source.display()
                )));
            }
        }
        Ok(dir)
    }

    /// Tries each known source shape in turn: the two-table address book
    /// layout first, then a flat single-table layout.
    fn load_source(&mut self, conn: &Connection) -> Result<usize, ExportError> {
        let loaded = self.load_address_book(conn)?;
        if loaded > 0 {
            return Ok(loaded);
        }
        self.load_flat_table(conn)
    }

    fn load_address_book(&mut self, conn: &Connection) -> Result<usize, ExportError> {
        if !table_exists(conn, "ABPerson")? || !table_exists(conn, "ABMultiValue")? {
            return Ok(0);
        }
        let first_col = pick_column(conn, "ABPerson", &["First", "first"])?;
        let last_col = pick_column(conn, "ABPerson", &["Last", "last"])?;
        let org_col = pick_column(conn, "ABPerson", &["Organization", "organization"])?;

        let mut stmt = conn.prepare(&format!(
            "SELECT p.ROWID, {first}, {last}, {org}, v.value
             FROM ABPerson p
             JOIN ABMultiValue v ON v.record_id = p.ROWID
             WHERE v.property = ?1 AND v.value IS NOT NULL;",
            first = first_col.as_deref().unwrap_or("NULL"),
            last = last_col.as_deref().unwrap_or("NULL"),
            org = org_col.as_deref().unwrap_or("NULL"),
        ))?;
        let rows = stmt.query_map([PHONE_PROPERTY], |row| {
            let first: Option<String> = row.get(1)?;
            let last: Option<String> = row.get(2)?;
            let org: Option<String> = row.get(3)?;
            let value: String = row.get(4)?;
            Ok((first, last, org, value))
        })?;
        let mut loaded = 0usize;
        for row in rows {
            let (first, last, org, value) = row?;
            let name = display_name(first.as_deref(), last.as_deref(), org.as_deref());
            self.names.insert(phone::normalize(&value), name);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Some exported address books collapse everything into one table. Accept
    /// any table carrying a phone-like column plus the usual name columns.
    fn load_flat_table(&mut self, conn: &Connection) -> Result<usize, ExportError> {
        for table in ["contacts", "people"] {
            if !table_exists(conn, table)? {
                continue;
            }
            let phone_col = match pick_column(conn, table, &["phone", "number", "value"])? {
                Some(col) => col,
                None => continue,
            };
            let first_col = pick_column(conn, table, &["first", "First", "first_name"])?;
            let last_col = pick_column(conn, table, &["last", "Last", "last_name"])?;
            let org_col =
                pick_column(conn, table, &["organization", "Organization", "company"])?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {first}, {last}, {org}, {phone}
                 FROM {table}
                 WHERE {phone} IS NOT NULL;",
                first = first_col.as_deref().unwrap_or("NULL"),
                last = last_col.as_deref().unwrap_or("NULL"),
                org = org_col.as_deref().unwrap_or("NULL"),
                phone = phone_col,
                table = table,
            ))?;
            let rows = stmt.query_map([], |row| {
                let first: Option<String> = row.get(0)?;
                let last: Option<String> = row.get(1)?;
                let org: Option<String> = row.get(2)?;
                let value: String = row.get(3)?;
                Ok((first, last, org, value))
            })?;
            let mut loaded = 0usize;
            for row in rows {
                let (first, last, org, value) = row?;
                let name = display_name(first.as_deref(), last.as_deref(), org.as_deref());
                self.names.insert(phone::normalize(&value), name);
                loaded += 1;
            }
            return Ok(loaded);
        }
        Ok(0)
    }

    /// Resolves a (possibly multi-party) address to display names. Parts with
    /// no match are dropped rather than echoed back as raw numbers.
    pub fn resolve(&self, address: &str) -> String {
        address
            .split(", ")
            .filter_map(|part| self.names.get(part).cloned())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[cfg(test)]
    pub fn insert(&mut self, number: &str, name: &str) {
        self.names.insert(number.to_string(), name.to_string());
    }
}

fn display_name(first: Option<&str>, last: Option<&str>, org: Option<&str>) -> String {
    let first = first.map(str::trim).filter(|s| !s.is_empty());
    let last = last.map(str::trim).filter(|s| !s.is_empty());
    let org = org.map(str::trim).filter(|s| !s.is_empty());
    match (first, last) {
        (Some(f), Some(l)) => format!("{} {}", f, l),
        (Some(f), None) => f.to_string(),
        (None, Some(l)) => l.to_string(),
        (None, None) => org.map(str::to_string).unwrap_or_else(|| "unknown".to_string()),
    }
}
