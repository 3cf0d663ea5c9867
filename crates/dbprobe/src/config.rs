//! Configuration types for dbprobe
//!
//! Two YAML documents drive a run:
//!   Agent parameters     → which backend, where, as whom, which packages
//!   Statement config     → which statements exist and how to run them
//!
//! Both support `${VAR}` and `${VAR:-default}` environment expansion.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::connection::BackendKind;
use crate::error::{Error, Result};
use crate::output::Separator;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {what} {}: {e}", path.display())))?;
    serde_yaml::from_str(&expand_env_vars(&content))
        .map_err(|e| Error::config(format!("cannot parse {what} {}: {e}", path.display())))
}

/// One connection string, a `;`-separated list, or a YAML list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConnectionStrings {
    /// Single value, possibly `;`-separated
    One(String),
    /// Explicit list
    Many(Vec<String>),
}

impl ConnectionStrings {
    /// Flatten into individual connection strings
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => s
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Self::Many(list) => list.clone(),
        }
    }
}

/// "Monitor every database" policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitorAll {
    /// Databases left out of the expansion
    #[serde(default)]
    pub exclude_dbs: Vec<String>,
}

/// Credentials for the privileged (ASM) connection
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct AsmCredentials {
    /// ASM user
    pub user: String,
    /// ASM password; usually supplied on the command line instead
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for AsmCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsmCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Log verbosity as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// debug
    Debug,
    /// info
    Info,
    /// warn
    #[serde(alias = "warning")]
    Warn,
    /// error
    #[default]
    Error,
    /// critical (mapped to error)
    Critical,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

/// Agent parameters: the resolved per-host configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Engine to monitor
    pub backend: Option<BackendKind>,

    /// Logon user
    pub user: String,

    /// TCP port (engine default when absent)
    #[serde(default)]
    pub port: Option<u16>,

    /// Named instance (mssql) or cluster name (postgres)
    #[serde(default)]
    pub instance: Option<String>,

    /// Database names or DSNs
    #[serde(default)]
    pub connection_string: Option<ConnectionStrings>,

    /// Statement packages to run
    #[serde(default)]
    pub packages: Vec<String>,

    /// Expand to every database on the server
    #[serde(default)]
    pub monitor_all: Option<MonitorAll>,

    /// Privileged logon for ASM statements (oracle)
    #[serde(default)]
    pub asm_credentials: Option<AsmCredentials>,

    /// Log verbosity; error when absent
    #[serde(default)]
    pub loglevel: Option<LogLevel>,

    /// Connect to the logical host name instead of the address
    #[serde(default)]
    pub enforce_dns_lookup: bool,

    /// Further package lists (`<anything>_pkgs`)
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl AgentConfig {
    /// Load agent parameters from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_yaml(path.as_ref(), "agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse agent parameters from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(yaml))
            .map_err(|e| Error::config(format!("cannot parse agent configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(Error::config("'user' must not be empty"));
        }
        if self.packages().is_empty() {
            return Err(Error::config("at least one statement package must be selected"));
        }
        Ok(())
    }

    /// Every selected package: `packages` plus all `*_pkgs` lists
    pub fn packages(&self) -> Vec<String> {
        let mut packages = self.packages.clone();
        let mut keys: Vec<&String> = self.extra.keys().filter(|k| k.ends_with("_pkgs")).collect();
        keys.sort();

        for key in keys {
            if let Some(serde_yaml::Value::Sequence(items)) = self.extra.get(key) {
                for item in items.iter().filter_map(|v| v.as_str()) {
                    if !packages.iter().any(|p| p == item) {
                        packages.push(item.to_string());
                    }
                }
            }
        }
        packages
    }

    /// Configured port or the engine default
    pub fn port_for(&self, backend: BackendKind) -> u16 {
        self.port.unwrap_or_else(|| backend.default_port())
    }
}

/// Restriction of a statement to specific targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecutionScope {
    /// Allowed connection strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<Vec<String>>,
    /// Allowed logical host names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_hostname: Option<Vec<String>>,
}

impl ExecutionScope {
    /// Both present constraints must match
    pub fn matches(&self, connection_string: &str, hostname: &str) -> bool {
        let cstr_ok = self
            .connection_string
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|c| c == connection_string));
        let host_ok = self
            .db_hostname
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|h| h == hostname));
        cstr_ok && host_ok
    }
}

/// How to run one statement
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StatementDescriptor {
    /// Packages the statement belongs to
    #[serde(default)]
    pub packages: Vec<String>,

    /// Target restriction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_scope: Option<ExecutionScope>,

    /// Cache lifetime in minutes; no caching when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_time_min: Option<u64>,

    /// Execution bound in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,

    /// Output separator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<Separator>,

    /// Section name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_header: Option<String>,

    /// Run on the privileged connection
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub asm_logon: bool,

    /// Free-form fields carried into structured output
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

impl StatementDescriptor {
    /// Whether any selected package owns this statement
    pub fn matches_packages(&self, selected: &[String]) -> bool {
        self.packages.iter().any(|p| selected.contains(p))
    }

    /// Cache lifetime, if caching is configured
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_time_min.map(|min| Duration::from_secs(min * 60))
    }
}

fn default_timeout_sec() -> u64 {
    15
}

fn default_cursor_timeout_sec() -> u64 {
    3
}

/// All statements of one backend
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatementSet {
    /// Separator for statements without their own
    #[serde(default)]
    pub default_separator: Option<Separator>,

    /// Timeout for statements without their own
    #[serde(default = "default_timeout_sec")]
    pub default_timeout_sec: u64,

    /// Statement directory override
    #[serde(default)]
    pub sql_dir: Option<PathBuf>,

    /// Statements in execution order
    #[serde(default)]
    pub statement_desc: IndexMap<String, StatementDescriptor>,
}

impl StatementSet {
    /// Effective separator of a statement
    pub fn separator_for(&self, desc: &StatementDescriptor) -> Option<Separator> {
        desc.separator.or(self.default_separator)
    }

    /// Effective timeout of a statement
    pub fn timeout_for(&self, desc: &StatementDescriptor) -> u64 {
        desc.timeout_sec.unwrap_or(self.default_timeout_sec)
    }

    /// Names of the regular and of the privileged statements, in order
    pub fn split_privileged(&self) -> (Vec<&str>, Vec<&str>) {
        let (privileged, regular): (Vec<_>, Vec<_>) =
            self.statement_desc.iter().partition(|(_, desc)| desc.asm_logon);
        (
            regular.into_iter().map(|(name, _)| name.as_str()).collect(),
            privileged.into_iter().map(|(name, _)| name.as_str()).collect(),
        )
    }
}

/// Statement configuration document
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatementConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_cursor_timeout_sec")]
    pub db_cursor_timeout_sec: u64,

    /// Statement sets keyed by backend name
    #[serde(flatten)]
    pub backends: HashMap<String, StatementSet>,
}

impl StatementConfig {
    /// Load the statement configuration; a missing file is fatal
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::config(format!(
                "statement configuration {} not found",
                path.display()
            )));
        }
        read_yaml(path, "statement configuration")
    }

    /// Parse the statement configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(&expand_env_vars(yaml))
            .map_err(|e| Error::config(format!("cannot parse statement configuration: {e}")))
    }

    /// Statement set of `backend`; missing sets are fatal
    pub fn statement_set(&self, backend: BackendKind) -> Result<&StatementSet> {
        self.backends
            .get(backend.name())
            .ok_or_else(|| Error::config(format!("no statement_desc found for backend {backend}")))
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_cursor_timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_YAML: &str = r#"
backend: mssql
user: monitor
instance: SQLEXPRESS
connection_string: "master;msdb"
packages: [base]
perf_pkgs: [counters, base]
monitor_all:
  exclude_dbs: [tempdb]
loglevel: info
"#;

    const STATEMENTS_YAML: &str = r#"
db_cursor_timeout_sec: 5
mssql:
  default_separator: sep(124)
  statement_desc:
    mssql_counters:
      packages: [counters]
      timeout_sec: 30
    mssql_backup:
      packages: [base]
      cache_time_min: 10
      separator: sep(9)
      execution_scope:
        db_hostname: [sql01]
    custom_sql:
      packages: [base]
      check_header: custom_sql
      service_name: Orphaned users
"#;

    #[test]
    fn test_agent_config() {
        let config = AgentConfig::from_yaml(AGENT_YAML).unwrap();

        assert_eq!(config.backend, Some(BackendKind::Mssql));
        assert_eq!(config.port_for(BackendKind::Mssql), 1433);
        assert_eq!(config.packages(), vec!["base".to_string(), "counters".to_string()]);
        assert_eq!(
            config.connection_string.unwrap().to_vec(),
            vec!["master".to_string(), "msdb".to_string()]
        );
        assert_eq!(config.monitor_all.unwrap().exclude_dbs, vec!["tempdb"]);
        assert_eq!(config.loglevel, Some(LogLevel::Info));
    }

    #[test]
    fn test_agent_config_requires_packages() {
        let err = AgentConfig::from_yaml("user: monitor\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_connection_string_list() {
        let yaml = "user: u\npackages: [p]\nconnection_string: [ORCL, PDB1]\n";
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.connection_string.unwrap().to_vec(),
            vec!["ORCL".to_string(), "PDB1".to_string()]
        );
    }

    #[test]
    fn test_statement_config() {
        let config = StatementConfig::from_yaml(STATEMENTS_YAML).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));

        let set = config.statement_set(BackendKind::Mssql).unwrap();
        let names: Vec<&String> = set.statement_desc.keys().collect();
        assert_eq!(names, ["mssql_counters", "mssql_backup", "custom_sql"]);

        let counters = &set.statement_desc["mssql_counters"];
        assert_eq!(set.timeout_for(counters), 30);
        assert_eq!(set.separator_for(counters), Some(Separator::Pipe));

        let backup = &set.statement_desc["mssql_backup"];
        assert_eq!(set.timeout_for(backup), 15);
        assert_eq!(set.separator_for(backup), Some(Separator::Tab));
        assert_eq!(backup.cache_ttl(), Some(Duration::from_secs(600)));

        let custom = &set.statement_desc["custom_sql"];
        assert_eq!(custom.extra["service_name"], serde_json::json!("Orphaned users"));

        assert!(config.statement_set(BackendKind::Oracle).unwrap_err().is_fatal());
    }

    #[test]
    fn test_execution_scope() {
        let scope = ExecutionScope {
            connection_string: Some(vec!["ORCL".into()]),
            db_hostname: Some(vec!["h1".into()]),
        };
        assert!(scope.matches("ORCL", "h1"));
        assert!(!scope.matches("ORCL", "h2"));
        assert!(!scope.matches("PDB1", "h1"));

        let host_only = ExecutionScope {
            connection_string: None,
            db_hostname: Some(vec!["h1".into()]),
        };
        assert!(host_only.matches("anything", "h1"));
        assert!(ExecutionScope::default().matches("x", "y"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("DBPROBE_TEST_USER", "from_env");
        let expanded = expand_env_vars("user: ${DBPROBE_TEST_USER}\nport: ${DBPROBE_TEST_UNSET:-1522}");
        assert_eq!(expanded, "user: from_env\nport: 1522");
    }

    #[test]
    fn test_missing_statement_file_is_fatal() {
        let err = StatementConfig::from_file("/nonexistent/statements.yml").unwrap_err();
        assert!(err.is_fatal());
    }
}
