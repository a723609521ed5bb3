//! Error types for the ingestion crate.

use std::fmt;

use netcdf_parser::{BackendStatus, NetCdfError};
use thiserror::Error;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum IngestionError {
    /// The archive, or a snapshot entry inside it, does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid archive {path}: {reason}")]
    InvalidArchive { path: String, reason: String },

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("No usable snapshot in {0}")]
    NoUsableSnapshot(String),

    /// Admin polygon join failed. Recovered inside the day pipeline.
    #[error("Admin mapping failed: {0}")]
    Mapping(String),

    /// Both the columnar writer and the delimited-text fallback failed.
    #[error("Failed to persist {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error("Cleanup manifest error: {0}")]
    Manifest(String),

    #[error("Failed to read file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to decode snapshot: {0}")]
    Decode(#[from] NetCdfError),
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;

/// Every decoding backend failed to open a snapshot.
#[derive(Debug, Clone)]
pub struct OpenError {
    /// Archive entry (or file) that could not be opened.
    pub entry: String,
    /// Backends tried, in order.
    pub attempted: Vec<String>,
    /// Text of the last backend error.
    pub last_error: String,
    /// Which backend modules exist in this build.
    pub availability: Vec<BackendStatus>,
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unable to open {} with any decoding backend", self.entry)?;
        if self.attempted.is_empty() {
            writeln!(f, "  attempted: (none available)")?;
        } else {
            writeln!(f, "  attempted: {}", self.attempted.join(", "))?;
        }
        writeln!(f, "  last error: {}", self.last_error)?;
        let modules: Vec<String> = self.availability.iter().map(|s| s.to_string()).collect();
        write!(f, "  backend modules: {}", modules.join(", "))
    }
}

impl std::error::Error for OpenError {}
