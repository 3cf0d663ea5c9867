//! # dbprobe
//!
//! Statement execution engine for remote database telemetry.
//!
//! For each configured connection the engine connects, discovers the engine
//! version, picks the version-appropriate SQL file for every configured
//! statement, runs it under a wall-clock bound, optionally caches the rows
//! on disk, reshapes them per backend and writes them as sections of a
//! line-oriented agent protocol.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbprobe::prelude::*;
//! use std::sync::Arc;
//!
//! let statements = StatementConfig::from_file("/etc/dbprobe/statements.yml")?;
//! let set = Arc::new(statements.statement_set(BackendKind::Postgres)?.clone());
//!
//! let executor = Executor::new(set, vec!["base".to_string()], StatementResolver::new("sql/postgres"))
//!     .with_cache(CacheStore::open("/var/cache/dbprobe")?);
//!
//! let target = ConnectionTarget::new(
//!     BackendKind::Postgres,
//!     "db1.example.com",
//!     "postgres",
//!     Credentials::new("monitor", password),
//! );
//!
//! let mut emitter = Emitter::new(std::io::stdout().lock());
//! let report = Orchestrator::new(Box::new(NativeBackends), target, executor)
//!     .run(&mut emitter)
//!     .await?;
//! ```
//!
//! ## Output
//!
//! ```text
//! <<<postgres_connection_time:sep(0)>>>
//! {"db_cstr":"postgres","connection_time":0.012,"error":null}
//! <<<agent_db_stats:sep(0)>>>
//! {"postgres":{"postgres_sessions":{"status":"OK","runtime":0.003,"exception":null,"timeout":15}}}
//! <<<postgres_sessions>>>
//! [[[main]]]
//! t 4
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL via tokio-postgres
//! - `mysql` - MySQL/MariaDB via mysql_async
//! - `mssql` - SQL Server via tiberius
//! - `oracle` - Oracle via the ODPI-C based `oracle` crate
//! - `full` - All backends

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod output;
pub mod resolver;
pub mod types;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Values and versions
    pub use crate::types::{ResultSet, Row, RowGroup, Value};
    pub use crate::version::Version;

    // Connections
    pub use crate::connection::{
        BackendKind, Connection, ConnectionHandle, ConnectionTarget, Credentials, ErrorSentinel,
    };

    // Backends
    pub use crate::backend::{
        Backend, BackendAdapter, BackendFactory, NativeBackends, TransformContext, VersionInfo,
    };

    // Configuration
    pub use crate::config::{
        AgentConfig, ConnectionStrings, ExecutionScope, LogLevel, MonitorAll, StatementConfig,
        StatementDescriptor, StatementSet,
    };

    // Engine
    pub use crate::cache::{CacheKey, CacheStore};
    pub use crate::executor::{
        ExecutionStats, Executor, RunSummary, StatementFilter, StatementStatus,
    };
    pub use crate::orchestrator::{ConnectionReport, Orchestrator, RunReport};
    pub use crate::output::{Emitter, SectionHeader, Separator};
    pub use crate::resolver::StatementResolver;
}

pub use error::{Error, Result};
