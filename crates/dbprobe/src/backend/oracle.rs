//! Oracle backend
//!
//! The `oracle` driver (ODPI-C) is synchronous; every call runs on the
//! blocking pool. Statements flagged for the ASM logon run on a second
//! connection opened `AS SYSDBA` against the `+ASM` service.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use super::{Backend, VersionInfo};
use crate::connection::{BackendKind, Connection, ConnectionTarget, Credentials};
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row, Value};
use crate::version::Version;

static VERSION_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"Version (\d+\.\d+\.\d+\.\d+\.\d+)")
        .expect("oracle version regex pattern is invalid - this is a bug")
});

static RELEASE_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"Release (\d+\.\d+\.\d+\.\d+\.\d+)")
        .expect("oracle release regex pattern is invalid - this is a bug")
});

/// Section the `v$version` banner is published in
pub const VERSION_SECTION: &str = "oracle_version_v2";

fn driver_error(e: oracle::Error) -> Error {
    Error::connection_with_source(e.to_string(), e)
}

fn oracle_row_to_row(row: &oracle::Row) -> Row {
    (0..row.sql_values().len())
        .map(|i| row.get::<usize, Option<String>>(i).ok().flatten().into())
        .collect()
}

/// Oracle connection
pub struct OracleConnection {
    conn: Arc<Mutex<oracle::Connection>>,
}

impl OracleConnection {
    fn run(conn: &oracle::Connection, sql: &str) -> Result<ResultSet> {
        let mut stmt = conn
            .statement(sql)
            .build()
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        if !stmt.is_query() {
            stmt.execute(&[])
                .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
            return Ok(vec![Vec::new()]);
        }

        let rows = stmt
            .query(&[])
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
        let mut group = Vec::new();
        for row in rows {
            let row = row.map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
            group.push(oracle_row_to_row(&row));
        }
        Ok(vec![group])
    }
}

#[async_trait]
impl Connection for OracleConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || Self::run(&conn.lock(), &sql))
            .await
            .map_err(|e| Error::internal(format!("query task failed: {}", e)))?
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || conn.lock().close().map_err(driver_error))
            .await
            .map_err(|e| Error::internal(format!("close task failed: {}", e)))?
    }
}

async fn connect(
    credentials: &Credentials,
    dsn: String,
    privilege: Option<oracle::Privilege>,
) -> Result<Arc<dyn Connection>> {
    let user = credentials.user.clone();
    let password = credentials.expose_password().to_string();

    let conn = tokio::task::spawn_blocking(move || {
        let mut connector = oracle::Connector::new(user, password, dsn);
        if let Some(privilege) = privilege {
            connector.privilege(privilege);
        }
        connector.connect()
    })
    .await
    .map_err(|e| Error::internal(format!("connect task failed: {}", e)))?
    .map_err(driver_error)?;

    Ok(Arc::new(OracleConnection {
        conn: Arc::new(Mutex::new(conn)),
    }))
}

/// Oracle backend
#[derive(Debug, Default)]
pub struct OracleBackend;

#[async_trait]
impl Backend for OracleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Oracle
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>> {
        debug!("Connecting to Oracle via {}", dsn_for(target));
        connect(&target.credentials, dsn_for(target), None).await
    }

    async fn open_privileged(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Option<Arc<dyn Connection>>> {
        let Some(credentials) = &target.privileged else {
            return Ok(None);
        };
        debug!("ASM logon enabled for statement, creating ASM connection");
        let dsn = format!("{}:{}/+ASM", target.host, target.port);
        connect(credentials, dsn, Some(oracle::Privilege::Sysdba))
            .await
            .map(Some)
    }

    async fn version(&self, conn: &dyn Connection) -> Result<VersionInfo> {
        let result = conn.query("SELECT * FROM v$version").await?;
        let first = result
            .first()
            .and_then(|group| group.first())
            .ok_or_else(|| Error::version("No version string found in Oracle DB return"))?;
        debug!("v$version returned: {:?}", first);

        let fields: Vec<String> = first.iter().map(Value::to_string).collect();
        let version = parse_version(&fields)?;
        Ok(VersionInfo {
            version,
            banner: fields.into_iter().next(),
        })
    }

    fn version_section(&self) -> Option<&'static str> {
        Some(VERSION_SECTION)
    }
}

/// Descriptors are used verbatim, service names go through easy connect
fn dsn_for(target: &ConnectionTarget) -> String {
    if target.is_dsn() {
        target.connection_string.clone()
    } else {
        format!("{}:{}/{}", target.host, target.port, target.connection_string)
    }
}

/// Major and minor concatenated, at most three digits: `21.3.0.0.0` → 213
///
/// A `Version x.y.z.w.v` token wins over a `Release` token.
fn parse_version(fields: &[String]) -> Result<Version> {
    let mut found = None;
    for field in fields {
        if let Some(caps) = VERSION_REGEX.captures(field) {
            found = Some(caps[1].to_string());
            break;
        }
        if let Some(caps) = RELEASE_REGEX.captures(field) {
            found = Some(caps[1].to_string());
        }
    }
    let version = found.ok_or_else(|| Error::version("No version string found in Oracle DB return"))?;
    Version::major_minor_concat(&version, Some(3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_token_wins() {
        let fields = vec![
            "Oracle Database 19c Enterprise Edition Release 19.0.0.0.0 - Production".to_string(),
            "Oracle Database 19c Enterprise Edition Release 19.0.0.0.0 - Production\nVersion 19.21.0.0.0".to_string(),
            "1".to_string(),
        ];
        assert_eq!(parse_version(&fields).unwrap(), Version::new(vec![192]));
    }

    #[test]
    fn test_release_only() {
        let fields = vec!["Oracle Database 11g Release 11.2.0.4.0 - 64bit Production".to_string()];
        assert_eq!(parse_version(&fields).unwrap(), Version::new(vec![112]));
    }

    #[test]
    fn test_no_version() {
        assert!(parse_version(&["PL/SQL".to_string()]).is_err());
    }

    #[test]
    fn test_dsn_for() {
        let creds = Credentials::new("system", "secret");
        let target = ConnectionTarget::new(BackendKind::Oracle, "db1", "ORCL", creds);
        assert_eq!(dsn_for(&target), "db1:1521/ORCL");

        let target = target.with_connection_string("(DESCRIPTION=(ADDRESS=(HOST=db1)))");
        assert_eq!(dsn_for(&target), "(DESCRIPTION=(ADDRESS=(HOST=db1)))");
    }
}
