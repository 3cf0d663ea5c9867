//! Backend adapters
//!
//! [`Backend`] holds the engine-specific hooks (connect, version discovery,
//! database listing, statement splitting, row reshaping, rendering).
//! [`BackendAdapter`] wraps one backend instance for one connection and runs
//! the shared flow around those hooks: timed connect with telemetry, version
//! discovery, privileged-connection selection and output formatting.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::config::StatementDescriptor;
use crate::connection::{BackendKind, Connection, ConnectionHandle, ConnectionTarget, ErrorSentinel};
use crate::error::{Error, Result};
use crate::output::{Emitter, SectionHeader, Separator};
use crate::types::{ResultSet, RowGroup, Value};
use crate::version::Version;

#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Section name whose statements are emitted as structured JSON and never reshaped
pub const CUSTOM_SQL_SECTION: &str = "custom_sql";

/// Engine version as discovered after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Comparable version used for statement selection
    pub version: Version,
    /// Full banner, for backends that publish it in its own section
    pub banner: Option<String>,
}

impl VersionInfo {
    /// Version without a banner
    pub fn new(version: Version) -> Self {
        Self {
            version,
            banner: None,
        }
    }
}

/// What a transform hook knows about the data it reshapes
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Section name (the statement's header override or its name)
    pub section: &'a str,
    /// Connection string the data came from
    pub connection_string: &'a str,
    /// Configured instance, if any
    pub instance: Option<&'a str>,
}

/// Engine-specific hooks
///
/// One instance serves exactly one connection, so transforms may keep state
/// across the statements of that connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The engine this backend speaks to
    fn kind(&self) -> BackendKind;

    /// Open the primary connection (the caller bounds this by the connect timeout)
    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>>;

    /// Discover the engine version on a live connection
    async fn version(&self, conn: &dyn Connection) -> Result<VersionInfo>;

    /// Section the version banner is published in, if any
    fn version_section(&self) -> Option<&'static str> {
        None
    }

    /// Names of every database on the server
    async fn list_databases(&self, _conn: &dyn Connection) -> Result<Vec<String>> {
        Err(Error::unsupported(format!(
            "listing all databases is not implemented for {}",
            self.kind()
        )))
    }

    /// Open the privileged connection, for engines that have one
    async fn open_privileged(
        &self,
        _target: &ConnectionTarget,
    ) -> Result<Option<Arc<dyn Connection>>> {
        Ok(None)
    }

    /// Split statement text into the parts sent to the server one by one
    fn split_statement(&self, sql: &str) -> Vec<String> {
        split_statement(sql, &["BEGIN"])
    }

    /// Reshape raw row-groups for the section they are emitted in
    fn transform(&mut self, _ctx: &TransformContext<'_>, result: ResultSet) -> ResultSet {
        result
    }

    /// Render one field of a plain section
    fn render_field(&self, value: &Value) -> String {
        sanitize(&value.to_string())
    }

    /// Render one row-group as separator-joined lines
    fn format_row_group(&self, group: &RowGroup, separator: Separator) -> String {
        let sep = separator.as_char().to_string();
        let mut out = String::new();
        for row in group {
            let fields: Vec<String> = row.iter().map(|v| self.render_field(v)).collect();
            out.push_str(&fields.join(&sep));
            out.push('\n');
        }
        out
    }
}

/// Replace line breaks inside a field so it stays on one protocol line
pub fn sanitize(field: &str) -> String {
    field.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Split `sql` on `;`, unless it starts with one of `single_prefixes`
///
/// Blank parts are dropped.
pub fn split_statement(sql: &str, single_prefixes: &[&str]) -> Vec<String> {
    let trimmed = sql.trim();
    if single_prefixes.iter().any(|p| trimmed.starts_with(p)) {
        return vec![trimmed.to_string()];
    }
    trimmed
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

/// Run every part on `conn`, concatenating the row-groups in order
pub async fn run_query(conn: &dyn Connection, parts: &[String]) -> Result<ResultSet> {
    let mut result = ResultSet::new();
    for part in parts {
        result.extend(conn.query(part).await?);
    }
    Ok(result)
}

/// First field of the first row, as text
pub(crate) fn first_text(result: &ResultSet) -> Option<String> {
    result
        .iter()
        .flat_map(|group| group.iter())
        .next()
        .and_then(|row| row.first())
        .filter(|v| !v.is_null())
        .map(Value::to_string)
}

/// First column of every row, as text
pub(crate) fn first_column(result: &ResultSet) -> Vec<String> {
    result
        .iter()
        .flat_map(|group| group.iter())
        .filter_map(|row| row.first())
        .filter(|v| !v.is_null())
        .map(Value::to_string)
        .collect()
}

/// Creates backends by engine
pub trait BackendFactory: Send + Sync {
    /// A fresh backend for one connection
    fn backend_for(&self, kind: BackendKind) -> Result<Box<dyn Backend>>;
}

/// Factory for the backends compiled into this build
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackends;

impl BackendFactory for NativeBackends {
    fn backend_for(&self, kind: BackendKind) -> Result<Box<dyn Backend>> {
        match kind {
            #[cfg(feature = "postgres")]
            BackendKind::Postgres => Ok(Box::<postgres::PostgresBackend>::default()),
            #[cfg(feature = "mysql")]
            BackendKind::Mysql => Ok(Box::<mysql::MysqlBackend>::default()),
            #[cfg(feature = "mssql")]
            BackendKind::Mssql => Ok(Box::<mssql::MssqlBackend>::default()),
            #[cfg(feature = "oracle")]
            BackendKind::Oracle => Ok(Box::<oracle::OracleBackend>::default()),
            #[allow(unreachable_patterns)]
            other => Err(Error::config(format!(
                "backend {other} is not compiled into this build (enable the '{other}' feature)"
            ))),
        }
    }
}

/// One backend bound to one connection
pub struct BackendAdapter {
    backend: Box<dyn Backend>,
    target: ConnectionTarget,
    handle: ConnectionHandle,
    privileged: Option<Arc<dyn Connection>>,
    privileged_attempted: bool,
}

impl BackendAdapter {
    /// Connect to `target`, always emitting connect-time telemetry
    ///
    /// A failed attempt yields an adapter holding an [`ErrorSentinel`]; only
    /// output errors are returned.
    pub async fn connect<W: Write>(
        backend: Box<dyn Backend>,
        target: ConnectionTarget,
        emitter: &mut Emitter<W>,
    ) -> Result<Self> {
        debug!(
            "Connecting to {} database '{}' on {}:{} as {}",
            target.backend,
            target.connection_string,
            target.host,
            target.port,
            target.credentials.user
        );

        let started = Instant::now();
        let opened = match tokio::time::timeout(target.connect_timeout, backend.open(&target)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "connect timed out after {}s",
                target.connect_timeout.as_secs()
            ))),
        };

        let handle = match opened {
            Ok(conn) => {
                let elapsed = started.elapsed().as_secs_f64();
                emitter.connection_time(target.backend, &target.connection_string, elapsed, None)?;
                ConnectionHandle::Live(conn)
            }
            Err(e) => {
                let sentinel = ErrorSentinel::from_error(&target, &e);
                error!("{}", sentinel);
                emitter.connection_time(
                    target.backend,
                    &target.connection_string,
                    0.0,
                    Some(&sentinel.message),
                )?;
                ConnectionHandle::Failed(sentinel)
            }
        };

        Ok(Self {
            backend,
            target,
            handle,
            privileged: None,
            privileged_attempted: false,
        })
    }

    /// The engine
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// The target this adapter is bound to
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// The primary handle
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Whether statements can run
    pub fn is_usable(&self) -> bool {
        self.handle.is_usable()
    }

    fn live(&self) -> Result<&Arc<dyn Connection>> {
        match &self.handle {
            ConnectionHandle::Live(conn) => Ok(conn),
            ConnectionHandle::Failed(sentinel) => Err(Error::connection(sentinel.message.clone())),
        }
    }

    /// Discover the engine version, publishing the banner section if the backend has one
    pub async fn version<W: Write>(&self, emitter: &mut Emitter<W>) -> Result<Version> {
        let conn = self.live()?;
        let info = self.backend.version(conn.as_ref()).await?;
        debug!("Version of '{}': {}", self.target.connection_string, info.version);

        if let (Some(section), Some(banner)) = (self.backend.version_section(), &info.banner) {
            emitter.section(&SectionHeader::new(section))?;
            emitter.line(&format!("{} {}", self.target.connection_string, banner))?;
        }
        Ok(info.version)
    }

    /// Every database on the server
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let conn = self.live()?;
        self.backend.list_databases(conn.as_ref()).await
    }

    /// Connection a statement runs on
    ///
    /// Statements flagged for the privileged logon use a lazily opened,
    /// reused privileged connection when the target has privileged
    /// credentials; if that cannot be opened the primary connection is used.
    pub async fn select_connection(
        &mut self,
        desc: &StatementDescriptor,
    ) -> Option<Arc<dyn Connection>> {
        let primary = self.handle.live().cloned()?;
        if !desc.asm_logon || self.target.privileged.is_none() {
            return Some(primary);
        }
        if let Some(conn) = &self.privileged {
            return Some(Arc::clone(conn));
        }
        if self.privileged_attempted {
            return Some(primary);
        }

        self.privileged_attempted = true;
        debug!("Opening privileged connection for {}", self.target.host);
        let opened = tokio::time::timeout(
            self.target.connect_timeout,
            self.backend.open_privileged(&self.target),
        )
        .await
        .unwrap_or_else(|_| Err(Error::timeout("privileged connect timed out")));

        match opened {
            Ok(Some(conn)) => {
                self.privileged = Some(Arc::clone(&conn));
                Some(conn)
            }
            Ok(None) => Some(primary),
            Err(e) => {
                let message = format!(
                    "Error while connecting to {} ASM: {e}, falling back to default connection",
                    self.kind().service_prefix()
                );
                warn!("{}", message);
                eprintln!("{message}");
                Some(primary)
            }
        }
    }

    /// Split statement text into server round trips
    pub fn split_statement(&self, sql: &str) -> Vec<String> {
        self.backend.split_statement(sql)
    }

    /// Reshape row-groups for `section`; the ad hoc query section passes through
    pub fn transform(&mut self, section: &str, result: ResultSet) -> ResultSet {
        if section == CUSTOM_SQL_SECTION {
            return result;
        }
        let ctx = TransformContext {
            section,
            connection_string: &self.target.connection_string,
            instance: self.target.instance.as_deref(),
        };
        self.backend.transform(&ctx, result)
    }

    /// Render one row-group for a plain section
    pub fn format(&self, group: &RowGroup, separator: Separator) -> String {
        self.backend.format_row_group(group, separator)
    }

    /// Close every open connection, logging failures
    pub async fn close(self) {
        if let Some(conn) = self.privileged {
            if let Err(e) = conn.close().await {
                warn!("Failed to close privileged connection: {}", e);
            }
        }
        if let ConnectionHandle::Live(conn) = self.handle {
            if let Err(e) = conn.close().await {
                warn!(
                    "Failed to close connection to '{}': {}",
                    self.target.connection_string, e
                );
            }
        }
    }
}

impl std::fmt::Debug for BackendAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("backend", &self.backend.kind())
            .field("target", &self.target)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
