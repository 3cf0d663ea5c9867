//! Error types for dbprobe
//!
//! Errors are classified so callers can decide how far a failure reaches:
//! - Per-statement failures (query, timeout, missing statement file)
//! - Per-connection failures (connect, version discovery)
//! - Run-level failures (configuration)

use std::fmt;
use thiserror::Error;

/// Result type for dbprobe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection could not be established
    Connection,
    /// Operation exceeded its time bound
    Timeout,
    /// Query execution failed
    Query,
    /// No suitable SQL file for a statement
    StatementNotFound,
    /// Engine version could not be determined
    Version,
    /// Cache read/write failure
    Cache,
    /// Invalid or missing configuration
    Configuration,
    /// Operation not supported by a backend
    Unsupported,
    /// I/O failure (statement files, output stream)
    Io,
    /// Serialization failure
    Serialization,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category abort the whole run
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Configuration)
    }
}

/// Main error type for dbprobe
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Query execution failed
    #[error("query error: {message}")]
    Query { message: String, sql: Option<String> },

    /// Statement file could not be resolved
    #[error("no statement file for {statement} (version {version})")]
    StatementNotFound { statement: String, version: String },

    /// Version string could not be parsed
    #[error("version error: {message}")]
    Version { message: String },

    /// Cache failure
    #[error("cache error: {message}")]
    Cache { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Query { .. } => ErrorCategory::Query,
            Self::StatementNotFound { .. } => ErrorCategory::StatementNotFound,
            Self::Version { .. } => ErrorCategory::Version,
            Self::Cache { .. } => ErrorCategory::Cache,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::Io(_) => ErrorCategory::Io,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error aborts the whole run
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Whether this error was caused by an elapsed time bound
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connection { message, .. } => message.to_lowercase().contains("timed out"),
            _ => false,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a statement-not-found error
    pub fn statement_not_found(statement: impl Into<String>, version: impl fmt::Display) -> Self {
        Self::StatementNotFound {
            statement: statement.into(),
            version: version.to_string(),
        }
    }

    /// Create a version error
    pub fn version(message: impl Into<String>) -> Self {
        Self::Version {
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Query => write!(f, "query"),
            Self::StatementNotFound => write!(f, "statement_not_found"),
            Self::Version => write!(f, "version"),
            Self::Cache => write!(f, "cache"),
            Self::Configuration => write!(f, "configuration"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Io => write!(f, "io"),
            Self::Serialization => write!(f, "serialization"),
            Self::Other => write!(f, "other"),
        }
    }
}
