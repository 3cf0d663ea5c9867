//! PostgreSQL backend
//!
//! - Connection over `tokio-postgres`, driver task spawned on the runtime
//! - Every query part yields a column-name row-group followed by the rows
//! - Sections are scoped by an `[[[instance]]]` marker, and database-scoped
//!   sections carry a `[databases_start]`/`[databases_end]` block

use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::SimpleQueryMessage;
use tracing::{debug, error};

use super::{first_column, first_text, sanitize, Backend, TransformContext, VersionInfo};
use crate::connection::{BackendKind, Connection, ConnectionTarget};
use crate::error::{Error, Result};
use crate::types::{single, ResultSet, Row, RowGroup, Value};
use crate::version::Version;

const DEFAULT_INSTANCE: &str = "main";

const SECTIONS_WITH_DB_LIST: &[&str] = &[
    "postgres_bloat",
    "postgres_query_duration",
    "postgres_locks",
    "postgres_connections",
    "postgres_stats",
];

const SECTIONS_WITHOUT_COLUMN_NAMES: &[&str] = &["postgres_sessions", "postgres_version"];

/// Index of the wasted index bytes column in `postgres_bloat`
const BLOAT_WASTED_IBYTES: usize = 16;

/// Whether a column can be read from the binary protocol; anything else is
/// fetched as text
fn decodes_typed(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::BYTEA
            | Type::DATE
            | Type::TIME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::UUID
            | Type::JSON
            | Type::JSONB
    ) || <String as FromSql>::accepts(ty)
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>> {
    row.try_get(idx).map_err(|e| {
        Error::query(format!(
            "cannot decode column '{}': {e}",
            row.columns()[idx].name()
        ))
    })
}

/// Convert a PostgreSQL value to a dbprobe Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx)?.into(),
        Type::INT2 => get::<i16>(row, idx)?.into(),
        Type::INT4 => get::<i32>(row, idx)?.into(),
        Type::INT8 => get::<i64>(row, idx)?.into(),
        Type::OID => get::<u32>(row, idx)?
            .map(|n| Value::Int(i64::from(n)))
            .unwrap_or(Value::Null),
        Type::FLOAT4 => get::<f32>(row, idx)?.into(),
        Type::FLOAT8 => get::<f64>(row, idx)?.into(),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx)?.into(),
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.into(),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?.into(),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)?.into(),
        Type::UUID => get::<uuid::Uuid>(row, idx)?
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?
            .map(Value::Json)
            .unwrap_or(Value::Null),
        _ => get::<String>(row, idx)?.into(),
    };
    Ok(value)
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect()
}

/// Rows of the text protocol: every field exactly as the server prints it
fn text_rows(messages: &[SimpleQueryMessage]) -> RowGroup {
    messages
        .iter()
        .filter_map(|message| match message {
            SimpleQueryMessage::Row(row) => Some(
                (0..row.len())
                    .map(|i| row.get(i).map(Value::text).unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

/// PostgreSQL connection
pub struct PgConnection {
    client: tokio_postgres::Client,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        let header: Row = stmt.columns().iter().map(|c| Value::text(c.name())).collect();
        if !stmt.columns().iter().all(|c| decodes_typed(c.type_())) {
            // interval, inet, xid, regclass, ... only have a text rendering here
            let messages = self
                .client
                .simple_query(sql)
                .await
                .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
            return Ok(vec![vec![header], text_rows(&messages)]);
        }

        let rows = self
            .client
            .query(&stmt, &[])
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
        let data = rows
            .iter()
            .map(pg_row_to_row)
            .collect::<Result<RowGroup>>()
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        Ok(vec![vec![header], data])
    }

    async fn close(&self) -> Result<()> {
        // The driver task ends when the client is dropped
        Ok(())
    }
}

/// PostgreSQL backend
#[derive(Debug, Default)]
pub struct PostgresBackend;

#[async_trait]
impl Backend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .dbname(&target.connection_string)
            .user(&target.credentials.user)
            .password(target.credentials.expose_password())
            .connect_timeout(target.connect_timeout)
            .application_name("dbprobe");

        let (client, connection) = config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source(e.to_string(), e))?;

        let cstr = target.connection_string.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection to '{}' failed: {}", cstr, e);
            }
        });

        Ok(Arc::new(PgConnection { client }))
    }

    async fn version(&self, conn: &dyn Connection) -> Result<VersionInfo> {
        let result = conn.query("SELECT version()").await?;
        // Skip the column-name row-group
        let data: ResultSet = result.into_iter().skip(1).collect();
        let banner = first_text(&data)
            .ok_or_else(|| Error::version("SELECT version() returned no rows"))?;
        debug!("Version returned: {}", banner);
        Ok(VersionInfo::new(parse_version(&banner)?))
    }

    async fn list_databases(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let result = conn
            .query("SELECT datname FROM pg_database WHERE datistemplate = false")
            .await?;
        let data: ResultSet = result.into_iter().skip(1).collect();
        Ok(first_column(&data))
    }

    fn transform(&mut self, ctx: &TransformContext<'_>, mut result: ResultSet) -> ResultSet {
        let section = ctx.section;
        let instance = ctx.instance.unwrap_or(DEFAULT_INSTANCE);

        let mut out: ResultSet = vec![vec![single(format!("[[[{instance}]]]"))]];
        if SECTIONS_WITH_DB_LIST.contains(&section) {
            out.push(vec![single("[databases_start]")]);
            out.push(vec![single(ctx.connection_string)]);
            out.push(vec![single("[databases_end]")]);
        }

        if section == "postgres_sessions" {
            let any_idle = result
                .iter()
                .any(|group| group.iter().any(|row| is_true(row.first())));
            if !any_idle {
                result.push(vec![vec![Value::Bool(true), Value::Int(0)]]);
            }
        }

        let start = usize::from(SECTIONS_WITHOUT_COLUMN_NAMES.contains(&section));
        out.extend(
            result
                .into_iter()
                .skip(start)
                .map(|group| transform_group(section, group)),
        );
        out
    }

    fn render_field(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            other => sanitize(&other.to_string()),
        }
    }
}

/// `true` as a typed value or in its text form
fn is_true(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Text(text)) => text == "t",
        _ => false,
    }
}

fn transform_group(section: &str, group: RowGroup) -> RowGroup {
    match section {
        "postgres_sessions" => group
            .into_iter()
            .map(|mut row| {
                if let Some(Value::Bool(flag)) = row.first() {
                    row[0] = Value::text(if *flag { "t" } else { "f" });
                }
                row
            })
            .collect(),
        "postgres_bloat" => integral_wasted_bytes(group),
        _ => group,
    }
}

/// Render bloat's wasted index bytes as an integer; the group is left
/// untouched if any value is not integer-valued
fn integral_wasted_bytes(group: RowGroup) -> RowGroup {
    let is_title = |row: &Row| {
        matches!((row.first(), row.get(1)), (Some(Value::Text(a)), Some(Value::Text(b))) if a == "db" && b == "schemaname")
    };

    let mut converted = Vec::with_capacity(group.len());
    for row in &group {
        if is_title(row) || row.len() <= BLOAT_WASTED_IBYTES {
            converted.push(None);
            continue;
        }
        match row[BLOAT_WASTED_IBYTES].as_f64() {
            Some(bytes) if bytes.fract() == 0.0 => converted.push(Some(format!("{}", bytes as i64))),
            _ => return group,
        }
    }

    group
        .into_iter()
        .zip(converted)
        .map(|(mut row, value)| {
            if let Some(value) = value {
                row[BLOAT_WASTED_IBYTES] = Value::Text(value);
            }
            row
        })
        .collect()
}

/// `PostgreSQL 16.2 (Debian 16.2-1.pgdg120+2) on x86_64-pc-linux-gnu, …` → 16.2
fn parse_version(banner: &str) -> Result<Version> {
    banner
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::version(format!("unexpected version banner '{banner}'")))?
        .parse()
}
