pub mod attachments;
pub mod backup;
pub mod contacts;
pub mod error;
pub mod exporter;
pub mod format;
pub mod interpreter;
pub mod merge;
pub mod phone;

pub use error::ExportError;
pub use exporter::{run, ExportConfig, RunStats};
