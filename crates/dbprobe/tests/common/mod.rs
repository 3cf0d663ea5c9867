//! Scripted in-memory backend shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use dbprobe::prelude::*;

/// What the scripted server does when it receives one SQL text
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these row-groups
    Rows(ResultSet),
    /// Fail with this message
    Fail(String),
    /// Sleep, then return these row-groups
    Sleep(Duration, ResultSet),
}

#[derive(Debug, Default)]
struct State {
    steps: HashMap<String, Step>,
    executed: Vec<(String, String)>,
    connects: Vec<String>,
    refused: HashSet<String>,
    databases: Vec<String>,
    version_fails: bool,
}

/// Handle to the scripted server; clones share state
#[derive(Debug, Clone)]
pub struct Script {
    kind: BackendKind,
    version: Version,
    state: Arc<Mutex<State>>,
}

impl Script {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            version: Version::new(vec![16, 2]),
            state: Arc::default(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn on(self, sql: &str, step: Step) -> Self {
        self.state.lock().steps.insert(sql.to_string(), step);
        self
    }

    pub fn refuse(self, connection_string: &str) -> Self {
        self.state.lock().refused.insert(connection_string.to_string());
        self
    }

    pub fn with_databases(self, databases: &[&str]) -> Self {
        self.state.lock().databases = databases.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_version(self) -> Self {
        self.state.lock().version_fails = true;
        self
    }

    /// `(connection string, sql)` in execution order
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.lock().executed.clone()
    }

    /// Connection strings in connect order
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn backend(&self) -> Box<dyn Backend> {
        Box::new(ScriptedBackend {
            script: self.clone(),
        })
    }
}

impl BackendFactory for Script {
    fn backend_for(&self, kind: BackendKind) -> Result<Box<dyn Backend>> {
        if kind != self.kind {
            return Err(Error::config(format!("backend {kind} is not scripted")));
        }
        Ok(self.backend())
    }
}

struct ScriptedBackend {
    script: Script,
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.script.kind
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<Arc<dyn Connection>> {
        let mut state = self.script.state.lock();
        state.connects.push(target.connection_string.clone());
        if state.refused.contains(&target.connection_string) {
            return Err(Error::connection("connection refused"));
        }
        Ok(Arc::new(ScriptedConnection {
            connection_string: target.connection_string.clone(),
            state: Arc::clone(&self.script.state),
        }))
    }

    async fn version(&self, _conn: &dyn Connection) -> Result<VersionInfo> {
        if self.script.state.lock().version_fails {
            return Err(Error::version("no version banner"));
        }
        Ok(VersionInfo::new(self.script.version.clone()))
    }

    async fn list_databases(&self, _conn: &dyn Connection) -> Result<Vec<String>> {
        Ok(self.script.state.lock().databases.clone())
    }
}

struct ScriptedConnection {
    connection_string: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        let step = {
            let mut state = self.state.lock();
            state
                .executed
                .push((self.connection_string.clone(), sql.to_string()));
            state.steps.get(sql).cloned()
        };

        match step {
            Some(Step::Rows(rows)) => Ok(rows),
            Some(Step::Fail(message)) => Err(Error::query_with_sql(message, sql)),
            Some(Step::Sleep(duration, rows)) => {
                tokio::time::sleep(duration).await;
                Ok(rows)
            }
            None => Ok(vec![Vec::new()]),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Target for `connection_string` on logical host `db1`
pub fn target(kind: BackendKind, connection_string: &str) -> ConnectionTarget {
    let mut target = ConnectionTarget::new(
        kind,
        "10.0.0.12",
        connection_string,
        Credentials::new("monitor", "secret"),
    );
    target.hostname = "db1".to_string();
    target
}

/// Statement directory holding `files`
pub fn sql_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

/// Statement set parsed from the `statement_desc` YAML of one backend
pub fn statement_set(yaml: &str) -> Arc<StatementSet> {
    Arc::new(serde_yaml::from_str(yaml).unwrap())
}

/// Text written to an in-memory emitter
pub fn output(emitter: Emitter<Vec<u8>>) -> String {
    String::from_utf8(emitter.into_inner()).unwrap()
}

/// Every `agent_db_stats` payload in `out`, in order
pub fn stats_lines(out: &str) -> Vec<serde_json::Value> {
    let lines: Vec<&str> = out.lines().collect();
    lines
        .windows(2)
        .filter(|pair| pair[0] == "<<<agent_db_stats:sep(0)>>>")
        .map(|pair| serde_json::from_str(pair[1]).unwrap())
        .collect()
}

/// Rows shorthand: text fields
pub fn rows(rows: &[&[&str]]) -> RowGroup {
    rows.iter()
        .map(|row| row.iter().map(|field| Value::text(*field)).collect())
        .collect()
}
