//! Connection contract for dbprobe
//!
//! - [`Connection`]: one live session able to run a single SQL part
//! - [`BackendKind`]: the four supported engines
//! - [`ConnectionTarget`]: everything needed to open one connection
//! - [`ConnectionHandle`]: a live connection or an [`ErrorSentinel`]

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::ResultSet;

/// A connection to a database
///
/// Implementations run one SQL part at a time. A part may yield several
/// row-groups (result sets) and engines exposing column metadata may put a
/// column-name row-group ahead of the data.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute one SQL part and collect every row-group it yields
    async fn query(&self, sql: &str) -> Result<ResultSet>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PostgreSQL
    Postgres,
    /// MySQL / MariaDB
    Mysql,
    /// Microsoft SQL Server
    Mssql,
    /// Oracle Database
    Oracle,
}

impl BackendKind {
    /// All engines, in a stable order
    pub const ALL: [BackendKind; 4] = [Self::Postgres, Self::Mysql, Self::Mssql, Self::Oracle];

    /// Lowercase name used for section names and configuration keys
    pub const fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
        }
    }

    /// Service prefix used in user-facing messages
    pub const fn service_prefix(self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Mysql => "MySQL",
            Self::Mssql => "MSSQL",
            Self::Oracle => "ORA",
        }
    }

    /// Default TCP port
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql => 3306,
            Self::Mssql => 1433,
            Self::Oracle => 1521,
        }
    }

    /// Database used when no connection string is configured
    pub const fn default_connection_string(self) -> Option<&'static str> {
        match self {
            Self::Postgres => Some("postgres"),
            Self::Mysql => Some("mysql"),
            Self::Mssql => Some("master"),
            Self::Oracle => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            "oracle" => Ok(Self::Oracle),
            other => Err(Error::config(format!("unknown backend '{other}'"))),
        }
    }
}

/// User name and password for one logon
#[derive(Clone)]
pub struct Credentials {
    /// User name
    pub user: String,
    /// Password, never logged
    pub password: SecretString,
}

impl Credentials {
    /// Create credentials
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Password in clear text, for handing to a driver
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Everything needed to open one connection
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    /// Engine
    pub backend: BackendKind,
    /// Address to connect to (IP address or resolvable name)
    pub host: String,
    /// Logical host name, used for scoping and cache keys
    pub hostname: String,
    /// TCP port
    pub port: u16,
    /// Named instance (mssql) or cluster name (postgres)
    pub instance: Option<String>,
    /// Database name, service name or full DSN
    pub connection_string: String,
    /// Primary logon
    pub credentials: Credentials,
    /// Privileged logon for statements flagged for the secondary connection
    pub privileged: Option<Credentials>,
    /// Bound on connection establishment
    pub connect_timeout: Duration,
}

impl ConnectionTarget {
    /// Create a target with the engine's default port and a 3 second connect timeout
    pub fn new(
        backend: BackendKind,
        host: impl Into<String>,
        connection_string: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let host = host.into();
        Self {
            backend,
            hostname: host.clone(),
            host,
            port: backend.default_port(),
            instance: None,
            connection_string: connection_string.into(),
            credentials,
            privileged: None,
            connect_timeout: Duration::from_secs(3),
        }
    }

    /// Same target pointed at another database
    pub fn with_connection_string(&self, connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..self.clone()
        }
    }

    /// Whether the connection string is a full descriptor rather than a name
    pub fn is_dsn(&self) -> bool {
        self.connection_string.starts_with('(')
    }
}

/// A failed connection attempt standing in for a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSentinel {
    /// Engine
    pub backend: BackendKind,
    /// Connection string the attempt was made for
    pub connection_string: String,
    /// User-facing diagnostic
    pub message: String,
    /// Whether the attempt ran into the connect timeout
    pub timed_out: bool,
}

impl ErrorSentinel {
    /// Build the sentinel for a connect failure on `target`
    pub fn from_error(target: &ConnectionTarget, error: &Error) -> Self {
        let timed_out = error.is_timeout();
        let prefix = target.backend.service_prefix();
        let message = if timed_out {
            format!(
                "Connection to {prefix} DB '{}' timed out after {} seconds. \
                 Port {}/TCP reachable from the monitoring server?",
                target.connection_string,
                target.connect_timeout.as_secs(),
                target.port
            )
        } else {
            format!(
                "Error while connecting to {prefix} DB '{}'. Exception:\n{error}",
                target.connection_string
            )
        };
        Self {
            backend: target.backend,
            connection_string: target.connection_string.clone(),
            message,
            timed_out,
        }
    }
}

impl fmt::Display for ErrorSentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of a connect attempt
#[derive(Clone)]
pub enum ConnectionHandle {
    /// Open connection
    Live(Arc<dyn Connection>),
    /// Failed attempt
    Failed(ErrorSentinel),
}

impl ConnectionHandle {
    /// The live connection, if any
    pub fn live(&self) -> Option<&Arc<dyn Connection>> {
        match self {
            Self::Live(conn) => Some(conn),
            Self::Failed(_) => None,
        }
    }

    /// Whether statements can run on this handle
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    /// The sentinel, if the attempt failed
    pub fn sentinel(&self) -> Option<&ErrorSentinel> {
        match self {
            Self::Live(_) => None,
            Self::Failed(sentinel) => Some(sentinel),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live(_) => f.write_str("ConnectionHandle::Live"),
            Self::Failed(sentinel) => f.debug_tuple("ConnectionHandle::Failed").field(sentinel).finish(),
        }
    }
}
