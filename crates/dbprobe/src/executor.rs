//! Per-statement execution on one connection
//!
//! For every configured statement the executor checks package and scope
//! applicability, consults the cache, resolves the versioned SQL text, runs
//! it on a spawned worker bounded by the statement timeout, and emits the
//! statistics section followed by the data section.
//!
//! A worker that overruns its deadline is abandoned, not cancelled: the
//! join handle is dropped and the task keeps running in the background. Its
//! result is discarded and it never writes to the cache. Until it finishes
//! it may still hold the connection, so later statements on the same
//! connection can run into their own deadline.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn, Instrument, Span};

use crate::backend::{run_query, BackendAdapter, CUSTOM_SQL_SECTION};
use crate::cache::{CacheKey, CacheStore};
use crate::config::{StatementDescriptor, StatementSet};
use crate::error::Result;
use crate::output::{Emitter, SectionHeader};
use crate::resolver::StatementResolver;
use crate::types::ResultSet;
use crate::version::Version;

/// Exception text recorded for a statement that overran its timeout
pub const TIMEOUT_MESSAGE: &str = "Query took too long and has been terminated";

/// Outcome class of one statement execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementStatus {
    /// Ran to completion or served from cache
    #[serde(rename = "OK")]
    Ok,
    /// Failed or overran its timeout
    #[serde(rename = "CRIT")]
    Crit,
}

/// Telemetry of one statement execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    /// `None` until the statement finished one way or another
    pub status: Option<StatementStatus>,
    /// Seconds; 0.0 when served from cache, `None` when the query failed
    pub runtime: Option<f64>,
    /// Failure text
    pub exception: Option<String>,
    /// Configured bound in seconds
    pub timeout: u64,
}

impl ExecutionStats {
    /// Fresh stats for a statement bounded by `timeout` seconds
    pub fn new(timeout: u64) -> Self {
        Self {
            status: None,
            runtime: None,
            exception: None,
            timeout,
        }
    }

    /// Stats of a cache hit
    pub fn cached(timeout: u64) -> Self {
        Self {
            status: Some(StatementStatus::Ok),
            runtime: Some(0.0),
            ..Self::new(timeout)
        }
    }

    fn succeed(&mut self, runtime: Duration) {
        self.status = Some(StatementStatus::Ok);
        self.runtime = Some(runtime.as_secs_f64());
    }

    fn fail(&mut self, exception: impl Into<String>) {
        self.status = Some(StatementStatus::Crit);
        self.exception = Some(exception.into());
    }

    /// Whether the statement overran its timeout
    pub fn timed_out(&self) -> bool {
        self.exception.as_deref() == Some(TIMEOUT_MESSAGE)
    }
}

/// Which statements of a set a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementFilter {
    /// Statements on the regular connection
    #[default]
    Regular,
    /// Statements flagged for the privileged logon
    Privileged,
    /// Everything
    All,
}

impl StatementFilter {
    fn includes(self, desc: &StatementDescriptor) -> bool {
        match self {
            Self::Regular => !desc.asm_logon,
            Self::Privileged => desc.asm_logon,
            Self::All => true,
        }
    }
}

/// Counters of one executor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Statements that ran to completion
    pub succeeded: usize,
    /// Statements served from cache
    pub cached: usize,
    /// Statements that failed with an error
    pub failed: usize,
    /// Statements that overran their timeout
    pub timed_out: usize,
    /// Statements without a usable SQL file
    pub unresolved: usize,
    /// Statements outside the package selection or execution scope
    pub skipped: usize,
}

impl RunSummary {
    /// Fold another summary into this one
    pub fn merge(&mut self, other: &RunSummary) {
        self.succeeded += other.succeeded;
        self.cached += other.cached;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.unresolved += other.unresolved;
        self.skipped += other.skipped;
    }

    /// Statements that produced a stats line
    pub fn attempted(&self) -> usize {
        self.succeeded + self.cached + self.failed + self.timed_out
    }
}

/// Runs a statement set against backend adapters
#[derive(Debug, Clone)]
pub struct Executor {
    statements: Arc<StatementSet>,
    packages: Arc<[String]>,
    resolver: StatementResolver,
    cache: Option<CacheStore>,
    span: Span,
}

impl Executor {
    /// Create an executor for the selected packages; caching is off until
    /// a store is attached
    pub fn new(
        statements: Arc<StatementSet>,
        packages: impl Into<Arc<[String]>>,
        resolver: StatementResolver,
    ) -> Self {
        Self {
            statements,
            packages: packages.into(),
            resolver,
            cache: None,
            span: Span::none(),
        }
    }

    /// Attach a cache store
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Span workers are instrumented with
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The statement set
    pub fn statements(&self) -> &StatementSet {
        &self.statements
    }

    /// Run every statement selected by `filter` on `adapter`
    ///
    /// Only output failures are returned; statement failures end up in the
    /// stats section and the summary.
    pub async fn run<W: Write>(
        &self,
        adapter: &mut BackendAdapter,
        version: &Version,
        emitter: &mut Emitter<W>,
        filter: StatementFilter,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if !adapter.is_usable() {
            debug!(
                "Skipping statements for '{}': no live connection",
                adapter.target().connection_string
            );
            return Ok(summary);
        }

        for (name, desc) in &self.statements.statement_desc {
            if !filter.includes(desc) {
                continue;
            }
            self.run_statement(adapter, version, emitter, name, desc, &mut summary)
                .await?;
        }
        Ok(summary)
    }

    async fn run_statement<W: Write>(
        &self,
        adapter: &mut BackendAdapter,
        version: &Version,
        emitter: &mut Emitter<W>,
        name: &str,
        desc: &StatementDescriptor,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if !desc.matches_packages(&self.packages) {
            summary.skipped += 1;
            return Ok(());
        }

        let target = adapter.target().clone();
        let in_scope = desc
            .execution_scope
            .as_ref()
            .map_or(true, |scope| scope.matches(&target.connection_string, &target.hostname));
        if !in_scope {
            debug!("Statement {} not in execution scope", name);
            summary.skipped += 1;
            return Ok(());
        }

        let header = desc.check_header.as_deref().unwrap_or(name);
        let separator = self.statements.separator_for(desc);
        let timeout = self.statements.timeout_for(desc);
        let ttl = desc.cache_ttl();
        debug!(
            "Statement: {}, cache_time_sec: {:?}",
            name,
            ttl.map(|t| t.as_secs())
        );

        let cache_key = CacheKey::new(&target.host, &target.connection_string, name);
        if let (Some(cache), Some(ttl)) = (&self.cache, ttl) {
            if let Some(hit) = cache.lookup(&cache_key, ttl) {
                debug!(
                    "Cache hit for: {} {} {}",
                    target.host, target.connection_string, name
                );
                let stats = ExecutionStats::cached(timeout);
                emitter.statement_stats(&target.connection_string, name, &stats)?;
                let section = SectionHeader::new(header)
                    .with_separator(separator)
                    .with_cache(hit.as_of, ttl.as_secs());
                summary.cached += 1;
                return self.emit_result(adapter, emitter, section, desc, hit.data, &stats);
            }
        }

        let sql = match self.resolver.resolve(name, version) {
            Ok(sql) => sql,
            Err(e) => {
                error!(
                    "Skipping execution of statement {} due to missing statement file: {}",
                    name, e
                );
                summary.unresolved += 1;
                return Ok(());
            }
        };

        let Some(conn) = adapter.select_connection(desc).await else {
            summary.skipped += 1;
            return Ok(());
        };
        let parts = adapter.split_statement(&sql);

        let worker = async move {
            let started = Instant::now();
            let result = run_query(conn.as_ref(), &parts).await;
            (result, started.elapsed())
        };
        let handle = tokio::spawn(worker.instrument(self.span.clone()));

        let mut stats = ExecutionStats::new(timeout);
        let data = match tokio::time::timeout(Duration::from_secs(timeout), handle).await {
            Ok(Ok((Ok(data), runtime))) => {
                stats.succeed(runtime);
                summary.succeeded += 1;
                if let (Some(cache), Some(_)) = (&self.cache, ttl) {
                    debug!("Writing cache for: {}", cache_key);
                    if let Err(e) = cache.store(&cache_key, &data) {
                        warn!("Failed to write cache for {}: {}", cache_key, e);
                    }
                }
                data
            }
            Ok(Ok((Err(e), _))) => {
                error!("Error running query {}: {}", name, e);
                stats.fail(e.to_string());
                summary.failed += 1;
                ResultSet::new()
            }
            Ok(Err(e)) => {
                error!("Worker for query {} failed: {}", name, e);
                stats.fail(e.to_string());
                summary.failed += 1;
                ResultSet::new()
            }
            Err(_) => {
                error!("Query {} took too long and has been terminated", name);
                stats.fail(TIMEOUT_MESSAGE);
                summary.timed_out += 1;
                ResultSet::new()
            }
        };

        emitter.statement_stats(&target.connection_string, name, &stats)?;
        let section = SectionHeader::new(header).with_separator(separator);
        self.emit_result(adapter, emitter, section, desc, data, &stats)
    }

    fn emit_result<W: Write>(
        &self,
        adapter: &mut BackendAdapter,
        emitter: &mut Emitter<W>,
        section: SectionHeader,
        desc: &StatementDescriptor,
        data: ResultSet,
        stats: &ExecutionStats,
    ) -> Result<()> {
        emitter.section(&section)?;
        let data = adapter.transform(&section.name, data);

        if section.name == CUSTOM_SQL_SECTION {
            let payload = structured_result(adapter, &section.name, desc, &data, stats)?;
            return emitter.json(&payload);
        }

        let separator = section.separator.unwrap_or_default();
        for group in &data {
            emitter.raw(&adapter.format(group, separator))?;
        }
        Ok(())
    }
}

/// JSON object of the ad hoc query section: result, backend identity and
/// stats, overlaid with the descriptor's own fields
fn structured_result(
    adapter: &BackendAdapter,
    header: &str,
    desc: &StatementDescriptor,
    data: &ResultSet,
    stats: &ExecutionStats,
) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::new();

    let result: Vec<serde_json::Value> = data
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|row| row.iter().map(|v| v.to_json()).collect::<Vec<_>>())
                .collect::<Vec<_>>()
                .into()
        })
        .collect();

    object.insert("result".into(), result.into());
    object.insert("backend".into(), adapter.kind().name().into());
    object.insert(
        "backend_service_prefix".into(),
        adapter.kind().service_prefix().into(),
    );
    object.insert("statement_name".into(), header.into());
    object.insert("stats".into(), serde_json::to_value(stats)?);

    if let serde_json::Value::Object(fields) = serde_json::to_value(desc)? {
        object.extend(fields);
    }
    Ok(serde_json::Value::Object(object))
}
