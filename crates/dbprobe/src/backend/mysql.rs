//! MySQL / MariaDB backend

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{first_text, Backend, VersionInfo};
use crate::connection::{BackendKind, Connection, ConnectionTarget};
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row, Value};
use crate::version::Version;

/// Convert a MySQL value to a dbprobe Value
///
/// The driver reports DATE and DATETIME alike; `column_type` tells them apart.
fn mysql_value_to_value(val: mysql_async::Value, column_type: ColumnType) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::Text(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int(n),
        mysql_async::Value::UInt(n) => Value::UInt(n),
        mysql_async::Value::Float(f) => Value::Float(f64::from(f)),
        mysql_async::Value::Double(d) => Value::Float(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) =
                chrono::NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
            else {
                return Value::Null;
            };
            if matches!(
                column_type,
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE
            ) {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(
                u32::from(hour),
                u32::from(min),
                u32::from(sec),
                micro,
            )
            .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
            .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            // Durations can exceed a day; keep them as text like the server prints them
            let hours = days * 24 + u32::from(hour);
            let sign = if neg { "-" } else { "" };
            if micro == 0 {
                Value::Text(format!("{sign}{hours:02}:{min:02}:{sec:02}"))
            } else {
                Value::Text(format!("{sign}{hours:02}:{min:02}:{sec:02}.{micro:06}"))
            }
        }
    }
}

fn mysql_row_to_row(row: mysql_async::Row) -> Row {
    let columns = row.columns();
    (0..row.len())
        .map(|i| {
            let val: mysql_async::Value = row.get(i).unwrap_or(mysql_async::Value::NULL);
            mysql_value_to_value(val, columns[i].column_type())
        })
        .collect()
}

/// MySQL connection
///
/// The driver needs `&mut Conn`; the connection is taken out for each query
/// and put back afterwards, also when the query fails.
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
}

impl MySqlConnection {
    async fn take_conn(&self) -> Result<Conn> {
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("Connection not available"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        let mut conn = self.take_conn().await?;
        let result = conn.query::<mysql_async::Row, _>(sql).await;
        self.put_conn(conn).await;

        let rows = result.map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
        Ok(vec![rows.into_iter().map(mysql_row_to_row).collect()])
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::connection(format!("Failed to disconnect: {}", e)))?;
        }
        Ok(())
    }
}

/// MySQL backend
#[derive(Debug, Default)]
pub struct MysqlBackend;

#[async_trait]
impl Backend for MysqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.credentials.user.clone()))
            .pass(Some(target.credentials.expose_password().to_string()))
            .db_name(Some(target.connection_string.clone()));

        let conn = Conn::new(opts)
            .await
            .map_err(|e| Error::connection_with_source(e.to_string(), e))?;

        Ok(Arc::new(MySqlConnection {
            conn: Mutex::new(Some(conn)),
        }))
    }

    async fn version(&self, conn: &dyn Connection) -> Result<VersionInfo> {
        let result = conn.query("SELECT version()").await?;
        let banner = first_text(&result)
            .ok_or_else(|| Error::version("SELECT version() returned no rows"))?;
        debug!("Version returned: {}", banner);
        Ok(VersionInfo::new(parse_version(&banner)?))
    }
}

/// `10.3.38-MariaDB-0ubuntu0.20.04.1` → 103
fn parse_version(banner: &str) -> Result<Version> {
    let release = banner.split('-').next().unwrap_or(banner);
    Version::major_minor_concat(release, None)
}
