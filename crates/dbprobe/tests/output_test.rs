//! Integration tests for protocol formatting

use dbprobe::backend::Backend;
use dbprobe::prelude::*;

#[derive(Debug, Default)]
struct PlainBackend;

#[async_trait::async_trait]
impl Backend for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
    }

    async fn open(&self, _target: &ConnectionTarget) -> Result<std::sync::Arc<dyn Connection>> {
        Err(Error::unsupported("offline"))
    }

    async fn version(&self, _conn: &dyn Connection) -> Result<VersionInfo> {
        Err(Error::unsupported("offline"))
    }
}

fn text_rows(rows: &[&[&str]]) -> RowGroup {
    rows.iter()
        .map(|row| row.iter().map(|f| Value::text(*f)).collect())
        .collect()
}

#[test]
fn test_rows_join_with_separator() {
    let group = text_rows(&[&["a", "b"], &["c", "d"]]);
    assert_eq!(PlainBackend.format_row_group(&group, Separator::Pipe), "a|b\nc|d\n");
    assert_eq!(PlainBackend.format_row_group(&group, Separator::Tab), "a\tb\nc\td\n");
    assert_eq!(PlainBackend.format_row_group(&group, Separator::Nul), "a\0b\nc\0d\n");
}

#[test]
fn test_line_breaks_inside_fields_are_flattened() {
    let group = text_rows(&[&["multi\nline", "crlf\r\nvalue"]]);
    assert_eq!(
        PlainBackend.format_row_group(&group, Separator::Space),
        "multi line crlf value\n"
    );
}

#[test]
fn test_cached_header() {
    let header = SectionHeader::new("name")
        .with_separator(Separator::Pipe)
        .with_cache(1_708_501_707, 600);
    assert_eq!(header.to_string(), "<<<name:sep(124):cached(1708501707,600)>>>");
}

#[test]
fn test_header_variants() {
    assert_eq!(SectionHeader::new("oracle_jobs").to_string(), "<<<oracle_jobs>>>");
    assert_eq!(
        SectionHeader::new("mssql_counters")
            .with_separator(Separator::Semicolon)
            .to_string(),
        "<<<mssql_counters:sep(59)>>>"
    );
}

#[test]
fn test_separator_codes_parse() {
    assert_eq!("sep(124)".parse::<Separator>().unwrap(), Separator::Pipe);
    assert_eq!("sep(09)".parse::<Separator>().unwrap(), Separator::Tab);
    assert_eq!("sep(0)".parse::<Separator>().unwrap(), Separator::Nul);
    assert!("sep(44)".parse::<Separator>().is_err());
}

#[test]
fn test_stats_and_connection_time_sections() {
    let mut emitter = Emitter::new(Vec::new());
    emitter
        .connection_time(BackendKind::Postgres, "postgres", 0.5, None)
        .unwrap();
    emitter
        .statement_stats("postgres", "postgres_locks", &ExecutionStats::cached(15))
        .unwrap();

    let out = String::from_utf8(emitter.into_inner()).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "<<<postgres_connection_time:sep(0)>>>");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(lines[1]).unwrap(),
        serde_json::json!({"db_cstr": "postgres", "connection_time": 0.5, "error": null})
    );
    assert_eq!(lines[2], "<<<agent_db_stats:sep(0)>>>");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(lines[3]).unwrap(),
        serde_json::json!({"postgres": {"postgres_locks": {
            "status": "OK", "runtime": 0.0, "exception": null, "timeout": 15
        }}})
    );
}
