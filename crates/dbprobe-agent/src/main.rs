//! dbprobe-agent - database telemetry collector
//!
//! Connects to one database host, runs the configured statement packages and
//! writes agent sections to stdout. Logs never go to stdout.
//!
//! # Usage
//!
//! ```bash
//! dbprobe-agent \
//!     --config /etc/dbprobe/db1.yml \
//!     --statements /etc/dbprobe/statements.yml \
//!     --sql-dir /usr/share/dbprobe \
//!     --hostname db1 --ipaddress 10.0.0.12
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use secrecy::SecretString;
use std::convert::Infallible;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbprobe::prelude::*;

#[derive(Parser)]
#[command(name = "dbprobe-agent")]
#[command(version, about = "Remote database telemetry collector")]
struct Cli {
    /// Database engine (overrides the agent configuration)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Agent parameters (YAML)
    #[arg(short, long, env = "DBPROBE_CONFIG")]
    config: PathBuf,

    /// Statement configuration (YAML)
    #[arg(short, long, env = "DBPROBE_STATEMENTS")]
    statements: PathBuf,

    /// Root of the statement directories (`<root>/<backend>/sql`)
    #[arg(long, env = "DBPROBE_SQL_DIR", default_value = ".")]
    sql_dir: PathBuf,

    /// Cache directory (defaults to a directory below the system temp dir)
    #[arg(long, env = "DBPROBE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Write logs to `<log_dir>/<hostname>.log` instead of stderr
    #[arg(long, env = "DBPROBE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Logical host name
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Address to connect to
    #[arg(long)]
    ipaddress: String,

    /// Password of the monitoring user
    #[arg(long, env = "DBPROBE_PASSWORD", hide_env_values = true, value_parser = parse_secret)]
    password: SecretString,

    /// Password of the ASM user (oracle)
    #[arg(long, env = "DBPROBE_ASM_PASSWORD", hide_env_values = true, value_parser = parse_secret)]
    asm_password: Option<SecretString>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_secret(value: &str) -> std::result::Result<SecretString, Infallible> {
    Ok(SecretString::from(value.to_string()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AgentConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load agent configuration from {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&cli, config.loglevel) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli, config) {
        Ok(report) => {
            let total = report.total();
            info!(
                "Done: {} ok, {} cached, {} failed, {} timed out, {} unresolved",
                total.succeeded, total.cached, total.failed, total.timed_out, total.unresolved
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `-v` wins over the configured level, which defaults to error
fn log_filter(verbose: bool, level: Option<LogLevel>) -> &'static str {
    if verbose {
        "debug"
    } else {
        level.unwrap_or_default().as_filter()
    }
}

fn init_logging(cli: &Cli, level: Option<LogLevel>) -> Result<()> {
    let level = log_filter(cli.verbose, level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(format!("{}.log", cli.hostname));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
    Ok(())
}

fn run(cli: Cli, config: AgentConfig) -> Result<RunReport> {
    let backend = match cli.backend.or(config.backend) {
        Some(backend) => backend,
        None => bail!("No backend configured: pass --backend or set 'backend'"),
    };

    let statement_config = StatementConfig::from_file(&cli.statements)
        .with_context(|| format!("Failed to load statement configuration from {}", cli.statements.display()))?;
    let statements = statement_config.statement_set(backend)?.clone();

    let sql_dir = statements
        .sql_dir
        .clone()
        .unwrap_or_else(|| default_sql_dir(&cli.sql_dir, backend));
    let resolver = StatementResolver::new(sql_dir);

    let mut executor = Executor::new(Arc::new(statements), config.packages(), resolver);
    let cache_dir = cli
        .cache_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("dbprobe").join("cache"));
    match CacheStore::open(&cache_dir) {
        Ok(cache) => executor = executor.with_cache(cache),
        Err(e) => warn!("Caching disabled: {}", e),
    }

    let target = build_target(&cli, &config, backend, statement_config.connect_timeout());
    let connection_strings = config
        .connection_string
        .as_ref()
        .map(ConnectionStrings::to_vec)
        .unwrap_or_default();

    let orchestrator = Orchestrator::new(Box::new(NativeBackends), target, executor)
        .with_connection_strings(connection_strings)
        .with_monitor_all(config.monitor_all.clone());

    // Workers abandoned on timeout must not keep the process alive
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let stdout = std::io::stdout();
    let mut emitter = Emitter::new(BufWriter::new(stdout.lock()));
    let result = runtime.block_on(orchestrator.run(&mut emitter));
    runtime.shutdown_background();

    let flushed = emitter.into_inner().flush();
    let report = result?;
    flushed.context("Failed to write agent output")?;
    Ok(report)
}

fn default_sql_dir(root: &Path, backend: BackendKind) -> PathBuf {
    root.join(backend.name()).join("sql")
}

fn build_target(
    cli: &Cli,
    config: &AgentConfig,
    backend: BackendKind,
    connect_timeout: std::time::Duration,
) -> ConnectionTarget {
    let host = if config.enforce_dns_lookup {
        cli.hostname.clone()
    } else {
        cli.ipaddress.clone()
    };

    let credentials = Credentials {
        user: config.user.clone(),
        password: cli.password.clone(),
    };

    let mut target = ConnectionTarget::new(backend, host, String::new(), credentials);
    target.hostname = cli.hostname.clone();
    target.port = config.port_for(backend);
    target.instance = config.instance.clone();
    target.connect_timeout = connect_timeout;
    target.privileged = config.asm_credentials.as_ref().and_then(|asm| {
        let password = match (&cli.asm_password, &asm.password) {
            (Some(secret), _) => secret.clone(),
            (None, Some(password)) => SecretString::from(password.clone()),
            (None, None) => return None,
        };
        Some(Credentials {
            user: asm.user.clone(),
            password,
        })
    });
    target
}
