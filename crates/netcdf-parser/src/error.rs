//! Error types for snapshot decoding operations.

use thiserror::Error;

/// Result type for NetCDF parser operations.
pub type NetCdfResult<T> = Result<T, NetCdfError>;

/// Error types for NetCDF parsing.
#[derive(Error, Debug)]
pub enum NetCdfError {
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Missing required variable or attribute
    #[error("Missing required data: {0}")]
    MissingData(String),

    /// Invalid data format
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    /// Command execution error (ncdump backend)
    #[error("Command execution failed: {0}")]
    CommandError(String),

    /// The decoding layer could not find or open the file
    #[error("Cannot open file: {0}")]
    NotFound(String),

    /// The backend does not support the requested access mode
    #[error("Unsupported by backend {backend}: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
}

impl NetCdfError {
    /// Whether this error belongs to the "file not found / cannot open" class.
    ///
    /// The C decoding layer reports some path encoding problems this way even
    /// when the file exists, so callers use this to decide whether retrying
    /// from a different path is worthwhile.
    pub fn is_not_found_class(&self) -> bool {
        match self {
            Self::IoError(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Self::NotFound(_) => true,
            other => {
                let msg = other.to_string().to_lowercase();
                msg.contains("no such file") || msg.contains("cannot open") || msg.contains("cannot find")
            }
        }
    }
}
