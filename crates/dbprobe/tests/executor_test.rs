//! Integration tests for statement execution on one connection

mod common;

use common::{output, rows, sql_dir, statement_set, stats_lines, target, Script, Step};
use dbprobe::executor::TIMEOUT_MESSAGE;
use dbprobe::prelude::*;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MYSQL_80: &[u64] = &[80];

fn executor(yaml: &str, dir: &TempDir) -> Executor {
    Executor::new(
        statement_set(yaml),
        vec!["base".to_string()],
        StatementResolver::new(dir.path()),
    )
}

async fn run(
    script: &Script,
    executor: &Executor,
    filter: StatementFilter,
) -> (RunSummary, String) {
    let mut emitter = Emitter::new(Vec::new());
    let mut adapter = BackendAdapter::connect(
        script.backend(),
        target(BackendKind::Mysql, "mysql"),
        &mut emitter,
    )
    .await
    .unwrap();
    let summary = executor
        .run(&mut adapter, &Version::new(MYSQL_80), &mut emitter, filter)
        .await
        .unwrap();
    adapter.close().await;
    (summary, output(emitter))
}

#[tokio::test]
async fn test_statement_emits_stats_then_rows() {
    let script = Script::new(BackendKind::Mysql).on(
        "SELECT a, b FROM t",
        Step::Rows(vec![rows(&[&["a", "b"], &["c", "d"]])]),
    );
    let dir = sql_dir(&[("mysql_status.sql", "SELECT a, b FROM t;\n")]);
    let executor = executor(
        r#"
default_separator: sep(124)
statement_desc:
  mysql_status:
    packages: [base]
"#,
        &dir,
    );

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary.succeeded, 1);
    assert!(out.ends_with("<<<mysql_status:sep(124)>>>\na|b\nc|d\n"), "{out}");
    let stats = stats_lines(&out);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0]["mysql"]["mysql_status"]["status"], "OK");
    assert!(stats[0]["mysql"]["mysql_status"]["runtime"].is_f64());
    assert_eq!(stats[0]["mysql"]["mysql_status"]["timeout"], 15);
}

#[tokio::test]
async fn test_versioned_file_is_selected() {
    let script = Script::new(BackendKind::Mysql);
    let dir = sql_dir(&[
        ("mysql_status.sql", "SELECT 'fallback'"),
        ("mysql_status_57.sql", "SELECT '57'"),
        ("mysql_status_80.sql", "SELECT '80'"),
        ("mysql_status_84.sql", "SELECT '84'"),
    ]);
    let executor = executor("statement_desc:\n  mysql_status:\n    packages: [base]\n", &dir);

    run(&script, &executor, StatementFilter::Regular).await;

    let executed: Vec<String> = script.executed().into_iter().map(|(_, sql)| sql).collect();
    assert_eq!(executed, vec!["SELECT '80'"]);
}

#[tokio::test]
async fn test_timeout_returns_within_bound() {
    let script = Script::new(BackendKind::Mysql).on(
        "SELECT SLEEP(5)",
        Step::Sleep(Duration::from_secs(5), vec![rows(&[&["late"]])]),
    );
    let dir = sql_dir(&[("slow.sql", "SELECT SLEEP(5)")]);
    let executor = executor(
        "statement_desc:\n  slow:\n    packages: [base]\n    timeout_sec: 1\n",
        &dir,
    );

    let started = Instant::now();
    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(summary.timed_out, 1);

    let stats = &stats_lines(&out)[0]["mysql"]["slow"];
    assert_eq!(stats["status"], "CRIT");
    assert_eq!(stats["exception"], TIMEOUT_MESSAGE);
    assert!(stats["runtime"].is_null());
    assert_eq!(stats["timeout"], 1);

    assert!(out.ends_with("<<<slow>>>\n"), "{out}");
    assert!(!out.contains("late"));
}

#[tokio::test]
async fn test_query_error_does_not_stop_the_run() {
    let script = Script::new(BackendKind::Mysql)
        .on("SELECT broken", Step::Fail("table t doesn't exist".into()))
        .on("SELECT 1", Step::Rows(vec![rows(&[&["1"]])]));
    let dir = sql_dir(&[("broken.sql", "SELECT broken"), ("ok.sql", "SELECT 1")]);
    let executor = executor(
        r#"
statement_desc:
  broken:
    packages: [base]
  ok:
    packages: [base]
"#,
        &dir,
    );

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    let stats = stats_lines(&out);
    assert_eq!(stats[0]["mysql"]["broken"]["status"], "CRIT");
    assert!(stats[0]["mysql"]["broken"]["exception"]
        .as_str()
        .unwrap()
        .contains("table t doesn't exist"));
    assert!(stats[0]["mysql"]["broken"]["runtime"].is_null());
    assert_eq!(stats[1]["mysql"]["ok"]["status"], "OK");
    assert!(out.contains("<<<broken>>>\n<<<agent_db_stats:sep(0)>>>"));
    assert!(out.ends_with("<<<ok>>>\n1\n"));
}

#[tokio::test]
async fn test_scope_mismatch_produces_nothing() {
    let script = Script::new(BackendKind::Mysql);
    let dir = sql_dir(&[("scoped.sql", "SELECT 1"), ("in_scope.sql", "SELECT 2")]);
    let executor = executor(
        r#"
statement_desc:
  scoped:
    packages: [base]
    execution_scope:
      db_hostname: [h1]
  in_scope:
    packages: [base]
    execution_scope:
      connection_string: [mysql]
      db_hostname: [db1]
"#,
        &dir,
    );

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(!out.contains("scoped"));
    assert_eq!(stats_lines(&out).len(), 1);
    let executed: Vec<String> = script.executed().into_iter().map(|(_, sql)| sql).collect();
    assert_eq!(executed, vec!["SELECT 2"]);
}

#[tokio::test]
async fn test_package_mismatch_is_silent() {
    let script = Script::new(BackendKind::Mysql);
    let dir = sql_dir(&[("replication.sql", "SHOW SLAVE STATUS")]);
    let executor = executor(
        "statement_desc:\n  replication:\n    packages: [replication]\n",
        &dir,
    );

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary.skipped, 1);
    assert!(stats_lines(&out).is_empty());
    assert!(script.executed().is_empty());
}

#[tokio::test]
async fn test_unresolved_statement_is_skipped_without_stats() {
    let script = Script::new(BackendKind::Mysql);
    let dir = sql_dir(&[("other_90.sql", "SELECT 1")]);
    let executor = executor(
        "statement_desc:\n  missing:\n    packages: [base]\n  other:\n    packages: [base]\n",
        &dir,
    );

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary.unresolved, 2);
    assert!(stats_lines(&out).is_empty());
    assert!(!out.contains("<<<missing"));
}

#[tokio::test]
async fn test_cache_hit_skips_execution() {
    let script = Script::new(BackendKind::Mysql)
        .on("SELECT x, y", Step::Rows(vec![rows(&[&["x", "y"]])]));
    let dir = sql_dir(&[("cached_stmt.sql", "SELECT x, y")]);
    let cache_dir = TempDir::new().unwrap();
    let executor = executor(
        r#"
statement_desc:
  cached_stmt:
    packages: [base]
    separator: sep(124)
    cache_time_min: 10
"#,
        &dir,
    )
    .with_cache(CacheStore::open(cache_dir.path()).unwrap());

    let (first, out) = run(&script, &executor, StatementFilter::Regular).await;
    assert_eq!(first.succeeded, 1);
    assert!(out.ends_with("<<<cached_stmt:sep(124)>>>\nx|y\n"));

    let (second, out) = run(&script, &executor, StatementFilter::Regular).await;
    assert_eq!(second.cached, 1);
    assert_eq!(script.executed().len(), 1);

    let stats = &stats_lines(&out)[0]["mysql"]["cached_stmt"];
    assert_eq!(stats["status"], "OK");
    assert_eq!(stats["runtime"], 0.0);
    assert!(out.contains("<<<cached_stmt:sep(124):cached("));
    assert!(out.ends_with(",600)>>>\nx|y\n"), "{out}");
}

#[tokio::test]
async fn test_custom_sql_is_structured() {
    let script = Script::new(BackendKind::Mysql).on(
        "SELECT id, name FROM orders",
        Step::Rows(vec![vec![vec![Value::Int(1), Value::text("x")]]]),
    );
    let dir = sql_dir(&[("adhoc_orders.sql", "SELECT id, name FROM orders")]);
    let executor = executor(
        r#"
statement_desc:
  adhoc_orders:
    packages: [base]
    check_header: custom_sql
    service_name: Orders
"#,
        &dir,
    );

    let (_, out) = run(&script, &executor, StatementFilter::Regular).await;

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[lines.len() - 2], "<<<custom_sql>>>");
    let payload: serde_json::Value = serde_json::from_str(lines[lines.len() - 1]).unwrap();
    assert_eq!(payload["result"], serde_json::json!([[[1, "x"]]]));
    assert_eq!(payload["backend"], "mysql");
    assert_eq!(payload["backend_service_prefix"], "MySQL");
    assert_eq!(payload["statement_name"], "custom_sql");
    assert_eq!(payload["service_name"], "Orders");
    assert_eq!(payload["packages"], serde_json::json!(["base"]));
    assert_eq!(payload["stats"]["status"], "OK");
}

#[tokio::test]
async fn test_custom_sql_descriptor_fields_take_precedence() {
    let script = Script::new(BackendKind::Mysql)
        .on("SELECT 1", Step::Rows(vec![rows(&[&["1"]])]));
    let dir = sql_dir(&[("adhoc_ping.sql", "SELECT 1")]);
    let executor = executor(
        r#"
statement_desc:
  adhoc_ping:
    packages: [base]
    check_header: custom_sql
    backend_service_prefix: MariaDB
    statement_name: ping
"#,
        &dir,
    );

    let (_, out) = run(&script, &executor, StatementFilter::Regular).await;

    let payload: serde_json::Value = serde_json::from_str(out.lines().last().unwrap()).unwrap();
    assert_eq!(payload["backend_service_prefix"], "MariaDB");
    assert_eq!(payload["statement_name"], "ping");
    assert_eq!(payload["backend"], "mysql");
    assert_eq!(payload["result"], serde_json::json!([[["1"]]]));
}

#[tokio::test]
async fn test_failed_connection_runs_nothing() {
    let script = Script::new(BackendKind::Mysql).refuse("mysql");
    let dir = sql_dir(&[("status.sql", "SELECT 1")]);
    let executor = executor("statement_desc:\n  status:\n    packages: [base]\n", &dir);

    let (summary, out) = run(&script, &executor, StatementFilter::Regular).await;

    assert_eq!(summary, RunSummary::default());
    assert!(script.executed().is_empty());

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "<<<mysql_connection_time:sep(0)>>>");
    let telemetry: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(telemetry["db_cstr"], "mysql");
    assert_eq!(telemetry["connection_time"], 0.0);
    assert!(telemetry["error"]
        .as_str()
        .unwrap()
        .starts_with("Error while connecting to MySQL DB 'mysql'. Exception:\n"));
}

#[tokio::test]
async fn test_privileged_statements_follow_the_filter() {
    let script = Script::new(BackendKind::Mysql);
    let dir = sql_dir(&[("regular.sql", "SELECT 1"), ("asm.sql", "SELECT 2")]);
    let executor = executor(
        r#"
statement_desc:
  regular:
    packages: [base]
  asm:
    packages: [base]
    asm_logon: true
"#,
        &dir,
    );

    let (regular, _) = run(&script, &executor, StatementFilter::Regular).await;
    let (privileged, _) = run(&script, &executor, StatementFilter::Privileged).await;

    assert_eq!(regular.succeeded, 1);
    assert_eq!(privileged.succeeded, 1);
    let executed: Vec<String> = script.executed().into_iter().map(|(_, sql)| sql).collect();
    assert_eq!(executed, vec!["SELECT 1", "SELECT 2"]);
}
