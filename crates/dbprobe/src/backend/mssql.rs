//! SQL Server backend
//!
//! Uses tiberius over a tokio TCP stream. Named instances are resolved
//! through the SQL Browser service. Statements may return several result
//! sets per round trip; all of them are kept.
//!
//! Reshaping follows the layout the classic `mssql.vbs` agent produced:
//! most sections get a leading `DB` instance column, counters are split out
//! of a single `|`-joined column, and tablespaces join two result sets into
//! one row.

use async_trait::async_trait;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, ColumnData, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::{first_column, first_text, sanitize, split_statement, Backend, TransformContext, VersionInfo};
use crate::connection::{BackendKind, Connection, ConnectionTarget};
use crate::error::{Error, Result};
use crate::types::{single, ResultSet, Row, RowGroup, Value};
use crate::version::Version;

/// Instance column value; the agent talks to exactly one instance per listener
const DEFAULT_PREFIX: &str = "DB";

/// Convert a tiberius row to a dbprobe Row
fn convert_row(row: &tiberius::Row) -> Row {
    row.cells()
        .enumerate()
        .map(|(i, (_col, data))| match data {
            ColumnData::Bit(Some(b)) => Value::Bool(*b),
            ColumnData::U8(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I16(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I32(Some(v)) => Value::Int(i64::from(*v)),
            ColumnData::I64(Some(v)) => Value::Int(*v),
            ColumnData::F32(Some(v)) => Value::Float(f64::from(*v)),
            ColumnData::F64(Some(v)) => Value::Float(*v),
            ColumnData::Numeric(Some(_)) => row
                .try_get::<rust_decimal::Decimal, _>(i)
                .ok()
                .flatten()
                .into(),
            ColumnData::String(Some(s)) => Value::Text(s.to_string()),
            ColumnData::Guid(Some(g)) => Value::Uuid(*g),
            ColumnData::Binary(Some(b)) => Value::Bytes(b.to_vec()),
            ColumnData::Xml(Some(xml)) => Value::Text(xml.to_string()),
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<chrono::NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .into(),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .into(),
            ColumnData::Date(Some(_)) => row
                .try_get::<chrono::NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(Value::Date)
                .unwrap_or(Value::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<chrono::NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(Value::Time)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        })
        .collect()
}

/// SQL Server connection
pub struct SqlServerConnection {
    client: Mutex<Client<Compat<TcpStream>>>,
}

#[async_trait]
impl Connection for SqlServerConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        let mut client = self.client.lock().await;
        let stream = client
            .simple_query(sql)
            .await
            .map_err(|e| Error::query_with_sql(format!("Query failed: {}", e), sql))?;

        let sets = stream
            .into_results()
            .await
            .map_err(|e| Error::query_with_sql(format!("Failed to fetch rows: {}", e), sql))?;

        Ok(sets
            .iter()
            .map(|rows| rows.iter().map(convert_row).collect())
            .collect())
    }

    async fn close(&self) -> Result<()> {
        // tiberius closes the socket on drop
        Ok(())
    }
}

/// SQL Server backend
///
/// Holds the per-connection reshaping state: whether the counters
/// timestamp row was emitted, and the first half of a tablespaces pair.
#[derive(Debug, Default)]
pub struct MssqlBackend {
    counters_started: bool,
    pending_tablespace: Option<Row>,
}

#[async_trait]
impl Backend for MssqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mssql
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>> {
        let mut config = Config::new();
        config.host(&target.host);
        config.port(target.port);
        config.database(&target.connection_string);
        config.authentication(AuthMethod::sql_server(
            &target.credentials.user,
            target.credentials.expose_password(),
        ));
        config.trust_cert();

        let tcp = match &target.instance {
            Some(instance) => {
                debug!(
                    "Instance connect to host {}:{}\\{} to db {}",
                    target.host, target.port, instance, target.connection_string
                );
                config.instance_name(instance);
                TcpStream::connect_named(&config)
                    .await
                    .map_err(|e| Error::connection_with_source(e.to_string(), e))?
            }
            None => TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| Error::connection_with_source(e.to_string(), e))?,
        };
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| Error::connection_with_source(e.to_string(), e))?;

        Ok(Arc::new(SqlServerConnection {
            client: Mutex::new(client),
        }))
    }

    async fn version(&self, conn: &dyn Connection) -> Result<VersionInfo> {
        let result = conn
            .query("SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128))")
            .await?;
        let banner = first_text(&result)
            .ok_or_else(|| Error::version("SERVERPROPERTY('ProductVersion') returned no rows"))?;
        debug!("Version returned: {}", banner);
        Ok(VersionInfo::new(parse_version(&banner)?))
    }

    async fn list_databases(&self, conn: &dyn Connection) -> Result<Vec<String>> {
        let result = conn.query("SELECT name FROM sys.databases").await?;
        Ok(first_column(&result))
    }

    fn split_statement(&self, sql: &str) -> Vec<String> {
        split_statement(sql, &["BEGIN", "DECLARE"])
    }

    fn transform(&mut self, ctx: &TransformContext<'_>, result: ResultSet) -> ResultSet {
        let result = if ctx.section == "mssql_blocked_sessions"
            && result.len() == 1
            && result[0].is_empty()
        {
            vec![vec![single("No blocking sessions")]]
        } else {
            result
        };

        result
            .into_iter()
            .map(|group| self.transform_group(ctx, group))
            .collect()
    }

    fn render_field(&self, value: &Value) -> String {
        sanitize(value.to_string().trim())
    }
}

impl MssqlBackend {
    fn transform_group(&mut self, ctx: &TransformContext<'_>, group: RowGroup) -> RowGroup {
        match ctx.section {
            "mssql_transactionlogs" | "mssql_datafiles" => {
                let with_db = prefixed(group, Value::text(ctx.connection_string));
                prefixed(with_db, Value::text(DEFAULT_PREFIX))
            }
            "mssql_availability_groups" => group,
            "mssql_counters" => self.counters(group),
            "mssql_tablespaces" => self.tablespaces(group),
            "mssql_backup" => prefixed(
                group.into_iter().map(backup_row).collect(),
                Value::text(DEFAULT_PREFIX),
            ),
            "mssql_databases" => prefixed(
                group.into_iter().map(database_row).collect(),
                Value::text(DEFAULT_PREFIX),
            ),
            "mssql_jobs" => group
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|v| if v.is_null() { Value::text("") } else { v })
                        .collect()
                })
                .collect(),
            _ => prefixed(group, Value::text(DEFAULT_PREFIX)),
        }
    }

    /// `object|counter|instance|value` → four fields; the first counters
    /// row-group of a connection starts with a `utc_time` row
    fn counters(&mut self, group: RowGroup) -> RowGroup {
        let mut out = Vec::with_capacity(group.len() + 1);
        if !self.counters_started {
            self.counters_started = true;
            out.push(vec![
                Value::text("None"),
                Value::text("utc_time"),
                Value::text("None"),
                Value::text(chrono::Utc::now().format("%d.%m.%Y %H:%M:%S").to_string()),
            ]);
        }
        out.extend(group.into_iter().map(split_counter));
        out
    }

    /// Rows arrive in pairs of row-groups; the first is held back and
    /// joined with the first row of the next
    fn tablespaces(&mut self, group: RowGroup) -> RowGroup {
        match self.pending_tablespace.take() {
            None => {
                self.pending_tablespace = group.into_iter().next();
                Vec::new()
            }
            Some(mut first) => {
                if let Some(second) = group.into_iter().next() {
                    first.extend(second);
                }
                prefixed(vec![first], Value::text(DEFAULT_PREFIX))
            }
        }
    }
}

fn prefixed(group: RowGroup, prefix: Value) -> RowGroup {
    group
        .into_iter()
        .map(|row| {
            let mut out = Vec::with_capacity(row.len() + 1);
            out.push(prefix.clone());
            out.extend(row);
            out
        })
        .collect()
}

fn split_counter(row: Row) -> Row {
    let Some(joined) = row.first().map(Value::to_string) else {
        return row;
    };
    let fields: Vec<&str> = joined.split('|').collect();
    let [object, counter, instance, value, ..] = fields.as_slice() else {
        return row;
    };
    let instance = if instance.is_empty() {
        "None".to_string()
    } else {
        instance.replace(' ', "_")
    };
    vec![
        Value::text(object.replace('$', "_").replace(' ', "_")),
        Value::text(counter.to_lowercase().replace(' ', "_")),
        Value::text(instance),
        Value::text(*value),
    ]
}

/// `(name, "2024-02-21 07:48:27", …, type)` → name, date, time+00:00, type
fn backup_row(row: Row) -> Row {
    if row.len() < 7 {
        return row;
    }
    let mut out = vec![row[0].clone()];
    let stamp = format!("{}+00:00", row[1]);
    out.extend(stamp.split_whitespace().map(Value::text));
    out.push(row[6].clone());
    out
}

/// Decode the UTF-8 name columns and the little-endian counter columns
fn database_row(row: Row) -> Row {
    if row.len() < 5 {
        return row;
    }
    vec![
        row[0].clone(),
        utf8(&row[1]),
        utf8(&row[2]),
        le_integer(&row[3]),
        le_integer(&row[4]),
    ]
}

fn utf8(value: &Value) -> Value {
    match value {
        Value::Bytes(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
        other => other.clone(),
    }
}

fn le_integer(value: &Value) -> Value {
    match value {
        Value::Bytes(b) if b.len() <= 8 => {
            let mut buf = [0u8; 8];
            buf[..b.len()].copy_from_slice(b);
            Value::UInt(u64::from_le_bytes(buf))
        }
        other => other.clone(),
    }
}

/// `15.0.2000.5` → 15.0
fn parse_version(banner: &str) -> Result<Version> {
    let major_minor: Vec<&str> = banner.trim().split('.').take(2).collect();
    major_minor.join(".").parse()
}
