//! Drives the executor once per connection string
//!
//! Connection strings come from the configuration, the backend default, or
//! the server's own database list ("monitor all"). Connections are handled
//! strictly one after another. Statements flagged for the privileged logon
//! run once per run, on the first connection, after every regular
//! statement; that connection stays open until then.

use std::io::Write;
use tracing::{debug, error, info, info_span, Instrument};

use crate::backend::{BackendAdapter, BackendFactory};
use crate::config::MonitorAll;
use crate::connection::ConnectionTarget;
use crate::error::{Error, Result};
use crate::executor::{Executor, RunSummary, StatementFilter};
use crate::output::Emitter;
use crate::version::Version;

/// What happened on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    /// Connection string
    pub connection_string: String,
    /// Whether the connect attempt succeeded
    pub connected: bool,
    /// Discovered engine version
    pub version: Option<Version>,
    /// Regular statements on this connection
    pub summary: RunSummary,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// One entry per processed connection string, in order
    pub connections: Vec<ConnectionReport>,
    /// Privileged statements, if any were configured
    pub privileged: Option<RunSummary>,
}

impl RunReport {
    /// Counters across every connection and the privileged pass
    pub fn total(&self) -> RunSummary {
        let mut total = RunSummary::default();
        for conn in &self.connections {
            total.merge(&conn.summary);
        }
        if let Some(privileged) = &self.privileged {
            total.merge(privileged);
        }
        total
    }

    /// Connection strings in processing order
    pub fn connection_strings(&self) -> Vec<&str> {
        self.connections
            .iter()
            .map(|c| c.connection_string.as_str())
            .collect()
    }
}

/// Runs the configured statements against every resolved connection
pub struct Orchestrator {
    factory: Box<dyn BackendFactory>,
    target: ConnectionTarget,
    connection_strings: Vec<String>,
    monitor_all: Option<MonitorAll>,
    executor: Executor,
}

impl Orchestrator {
    /// Create an orchestrator; `target` is the template every connection
    /// string is applied to
    pub fn new(factory: Box<dyn BackendFactory>, target: ConnectionTarget, executor: Executor) -> Self {
        Self {
            factory,
            target,
            connection_strings: Vec::new(),
            monitor_all: None,
            executor,
        }
    }

    /// Configured connection strings; empty means the backend default
    pub fn with_connection_strings(mut self, connection_strings: Vec<String>) -> Self {
        self.connection_strings = connection_strings;
        self
    }

    /// Expand to every database on the server
    pub fn with_monitor_all(mut self, monitor_all: Option<MonitorAll>) -> Self {
        self.monitor_all = monitor_all;
        self
    }

    /// Configured connection strings, or the backend default
    pub fn resolve_connection_strings(&self) -> Result<Vec<String>> {
        if !self.connection_strings.is_empty() {
            return Ok(self.connection_strings.clone());
        }
        self.target
            .backend
            .default_connection_string()
            .map(|cstr| vec![cstr.to_string()])
            .ok_or_else(|| {
                Error::config(format!(
                    "no connection string configured and {} has no default",
                    self.target.backend
                ))
            })
    }

    /// Every database on the server minus the excluded ones
    ///
    /// Not being able to connect or list is fatal: nothing could be
    /// monitored.
    pub async fn expand_all<W: Write>(
        &self,
        seed: &str,
        monitor_all: &MonitorAll,
        emitter: &mut Emitter<W>,
    ) -> Result<Vec<String>> {
        let backend = self.factory.backend_for(self.target.backend)?;
        let adapter =
            BackendAdapter::connect(backend, self.target.with_connection_string(seed), emitter)
                .await?;

        if let Some(sentinel) = adapter.handle().sentinel() {
            let message = format!(
                "Could not connect to DB {} to get list of DBs - {}",
                seed, sentinel
            );
            adapter.close().await;
            return Err(Error::config(message));
        }

        let listed = adapter.list_databases().await;
        adapter.close().await;
        let all = listed
            .map_err(|e| Error::config(format!("Could not list databases on {}: {}", seed, e)))?;

        debug!("Databases on {}: {:?}", self.target.host, all);
        Ok(all
            .into_iter()
            .filter(|db| !monitor_all.exclude_dbs.contains(db))
            .collect())
    }

    /// Process every connection string
    ///
    /// Returns an error only for fatal configuration problems and output
    /// failures.
    pub async fn run<W: Write>(&self, emitter: &mut Emitter<W>) -> Result<RunReport> {
        let mut connection_strings = self.resolve_connection_strings()?;
        if let Some(monitor_all) = &self.monitor_all {
            connection_strings = self
                .expand_all(&connection_strings[0], monitor_all, emitter)
                .await?;
        }

        let (regular, privileged) = self.executor.statements().split_privileged();
        debug!(
            "{} regular and {} privileged statement(s) configured",
            regular.len(),
            privileged.len()
        );
        let has_privileged = !privileged.is_empty();

        let mut report = RunReport::default();
        let mut first: Option<(BackendAdapter, Version, Executor)> = None;

        for (i, cstr) in connection_strings.iter().enumerate() {
            let span = info_span!("connection", backend = %self.target.backend, cstr = %cstr);
            let executor = self.executor.clone().with_span(span.clone());

            let (conn_report, adapter, version) = self
                .process_connection(cstr, &executor, emitter)
                .instrument(span)
                .await?;
            report.connections.push(conn_report);
            emitter.flush()?;

            match (adapter, version) {
                (Some(adapter), Some(version)) if i == 0 && has_privileged => {
                    first = Some((adapter, version, executor));
                }
                (Some(adapter), _) => adapter.close().await,
                (None, _) => {}
            }
        }

        if let Some((mut adapter, version, executor)) = first {
            let summary = executor
                .run(&mut adapter, &version, emitter, StatementFilter::Privileged)
                .await;
            adapter.close().await;
            report.privileged = Some(summary?);
            emitter.flush()?;
        }

        info!(
            "Processed {} connection(s) to {}",
            report.connections.len(),
            self.target.host
        );
        Ok(report)
    }

    async fn process_connection<W: Write>(
        &self,
        cstr: &str,
        executor: &Executor,
        emitter: &mut Emitter<W>,
    ) -> Result<(ConnectionReport, Option<BackendAdapter>, Option<Version>)> {
        let backend = self.factory.backend_for(self.target.backend)?;
        let target = self.target.with_connection_string(cstr);
        debug!("Processing {:?}", target);

        let mut report = ConnectionReport {
            connection_string: cstr.to_string(),
            connected: false,
            version: None,
            summary: RunSummary::default(),
        };

        let mut adapter = BackendAdapter::connect(backend, target, emitter).await?;
        if !adapter.is_usable() {
            return Ok((report, None, None));
        }
        report.connected = true;

        let version = match adapter.version(emitter).await {
            Ok(version) => version,
            Err(e) => {
                error!("Could not determine version of '{}': {}", cstr, e);
                return Ok((report, Some(adapter), None));
            }
        };
        report.version = Some(version.clone());

        report.summary = executor
            .run(&mut adapter, &version, emitter, StatementFilter::Regular)
            .await?;
        Ok((report, Some(adapter), Some(version)))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("target", &self.target)
            .field("connection_strings", &self.connection_strings)
            .field("monitor_all", &self.monitor_all)
            .finish_non_exhaustive()
    }
}
