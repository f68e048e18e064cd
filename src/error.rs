use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type covering the failure cases of the workbook store, the relational
/// mirror and the orchestration between them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The workbook file could not be opened, created or replaced.
    #[error("cannot access {}: {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Raised when the package does not follow the spreadsheet conventions.
    #[error("invalid workbook package: {0}")]
    Format(String),

    /// Raised when a required sheet, row or table is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// The database could not be reached or rejected the credentials.
    #[error("database connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    /// A statement was rejected by the database.
    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Raised when an operation exceeds its allotted time.
    #[error("{operation} timed out after {}ms", limit.as_millis())]
    Timeout { operation: String, limit: Duration },

    /// Raised when caller supplied input does not satisfy the schema.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Wrapper for IO failures such as reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors bubbled up from the XML reader and writer.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Raised when an XML attribute is malformed.
    #[error("XML attribute error: {0}")]
    XmlAttribute(#[from] quick_xml::events::attributes::AttrError),

    /// Errors bubbled up from the zip container.
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Raised when JSON parsing or serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raised when a CSV source cannot be decoded.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Raised when a background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// Raised when the settings file cannot be read or parsed.
    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

/// Coarse classification of [`StoreError`] used by callers that only care
/// about how a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Access,
    Format,
    NotFound,
    Connection,
    Query,
    Timeout,
    Validation,
    Other,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Access { .. } | StoreError::Io(_) => ErrorKind::Access,
            StoreError::Format(_)
            | StoreError::Xml(_)
            | StoreError::XmlAttribute(_)
            | StoreError::Zip(_) => ErrorKind::Format,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Connection(_) => ErrorKind::Connection,
            StoreError::Query(_) => ErrorKind::Query,
            StoreError::Timeout { .. } => ErrorKind::Timeout,
            StoreError::Validation(_) | StoreError::Csv(_) => ErrorKind::Validation,
            StoreError::Json(_)
            | StoreError::Task(_)
            | StoreError::Config { .. }
            | StoreError::Logging(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Access {
            path: path.into(),
            source,
        }
    }
}
