use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("source error: {0}")]
    Source(String),
    #[error("contacts error: {0}")]
    Contacts(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("bad record timestamp: {0}")]
    Timestamp(String),
}
