//! Integration tests for the per-connection driver

mod common;

use common::{output, rows, sql_dir, statement_set, stats_lines, target, Script, Step};
use dbprobe::prelude::*;
use tempfile::TempDir;

const STATEMENTS: &str = r#"
statement_desc:
  sessions:
    packages: [base]
  asm_diskgroup:
    packages: [base]
    asm_logon: true
"#;

fn orchestrator(script: &Script, kind: BackendKind, dir: &TempDir, yaml: &str) -> Orchestrator {
    let executor = Executor::new(
        statement_set(yaml),
        vec!["base".to_string()],
        StatementResolver::new(dir.path()),
    );
    Orchestrator::new(Box::new(script.clone()), target(kind, ""), executor)
}

fn statements_dir() -> TempDir {
    sql_dir(&[
        ("sessions.sql", "SELECT count(*) FROM sessions"),
        ("asm_diskgroup.sql", "SELECT name FROM diskgroups"),
    ])
}

#[tokio::test]
async fn test_monitor_all_excludes_databases() {
    let script = Script::new(BackendKind::Postgres).with_databases(&["a", "b", "c"]);
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Postgres, &dir, "statement_desc: {}\n")
        .with_monitor_all(Some(MonitorAll {
            exclude_dbs: vec!["b".to_string()],
        }));

    let mut emitter = Emitter::new(Vec::new());
    let report = orch.run(&mut emitter).await.unwrap();

    assert_eq!(report.connection_strings(), vec!["a", "c"]);
    // seed connection for the listing, then one per database
    assert_eq!(script.connects(), vec!["postgres", "a", "c"]);
}

#[tokio::test]
async fn test_monitor_all_without_seed_connection_is_fatal() {
    let script = Script::new(BackendKind::Postgres).refuse("postgres");
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Postgres, &dir, STATEMENTS)
        .with_monitor_all(Some(MonitorAll::default()));

    let mut emitter = Emitter::new(Vec::new());
    let err = orch.run(&mut emitter).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("Could not connect to DB postgres"));
}

#[tokio::test]
async fn test_connections_are_processed_in_order() {
    let script = Script::new(BackendKind::Mssql)
        .refuse("broken")
        .on("SELECT count(*) FROM sessions", Step::Rows(vec![rows(&[&["4"]])]));
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Mssql, &dir, "statement_desc:\n  sessions:\n    packages: [base]\n")
        .with_connection_strings(vec!["master".into(), "broken".into(), "msdb".into()]);

    let mut emitter = Emitter::new(Vec::new());
    let report = orch.run(&mut emitter).await.unwrap();
    let out = output(emitter);

    assert_eq!(report.connection_strings(), vec!["master", "broken", "msdb"]);
    assert!(report.connections[0].connected);
    assert!(!report.connections[1].connected);
    assert_eq!(report.total().succeeded, 2);

    let stats = stats_lines(&out);
    assert_eq!(stats.len(), 2);
    assert!(stats[0].get("master").is_some());
    assert!(stats[1].get("msdb").is_some());
    assert_eq!(out.matches("<<<mssql_connection_time:sep(0)>>>").count(), 3);
}

#[tokio::test]
async fn test_privileged_statements_run_once_after_regular_ones() {
    let script = Script::new(BackendKind::Oracle);
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Oracle, &dir, STATEMENTS)
        .with_connection_strings(vec!["ORCL".into(), "PDB1".into()]);

    let mut emitter = Emitter::new(Vec::new());
    let report = orch.run(&mut emitter).await.unwrap();

    assert_eq!(
        script.executed(),
        vec![
            ("ORCL".to_string(), "SELECT count(*) FROM sessions".to_string()),
            ("PDB1".to_string(), "SELECT count(*) FROM sessions".to_string()),
            ("ORCL".to_string(), "SELECT name FROM diskgroups".to_string()),
        ]
    );
    assert_eq!(report.privileged.map(|s| s.succeeded), Some(1));
    // no reconnect for the privileged pass
    assert_eq!(script.connects(), vec!["ORCL", "PDB1"]);
}

#[tokio::test]
async fn test_version_failure_skips_connection() {
    let script = Script::new(BackendKind::Mysql).failing_version();
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Mysql, &dir, STATEMENTS);

    let mut emitter = Emitter::new(Vec::new());
    let report = orch.run(&mut emitter).await.unwrap();

    assert_eq!(report.connection_strings(), vec!["mysql"]);
    assert!(report.connections[0].connected);
    assert!(report.connections[0].version.is_none());
    assert!(report.privileged.is_none());
    assert!(script.executed().is_empty());
}

#[tokio::test]
async fn test_oracle_requires_connection_string() {
    let script = Script::new(BackendKind::Oracle);
    let dir = statements_dir();
    let orch = orchestrator(&script, BackendKind::Oracle, &dir, STATEMENTS);

    let mut emitter = Emitter::new(Vec::new());
    let err = orch.run(&mut emitter).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(script.connects().is_empty());
    assert!(output(emitter).is_empty());
}
