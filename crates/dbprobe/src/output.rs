//! Line-oriented section protocol
//!
//! ```text
//! <<<name>>>
//! <<<name:sep(124)>>>
//! <<<name:sep(124):cached(1708501707,600)>>>
//! ```
//!
//! Plain sections carry one separator-joined line per row. The connection
//! time, statistics and ad hoc query sections carry one JSON object per line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::connection::BackendKind;
use crate::error::{Error, Result};
use crate::executor::ExecutionStats;

/// Section name of the per-statement statistics
pub const STATS_SECTION: &str = "agent_db_stats";

/// Field separator of a plain section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Separator {
    /// `sep(32)`, the protocol default
    #[default]
    Space,
    /// `sep(124)`
    Pipe,
    /// `sep(9)`
    Tab,
    /// `sep(59)`
    Semicolon,
    /// `sep(0)`
    Nul,
}

impl Separator {
    /// Character placed between fields
    pub const fn as_char(self) -> char {
        match self {
            Self::Space => ' ',
            Self::Pipe => '|',
            Self::Tab => '\t',
            Self::Semicolon => ';',
            Self::Nul => '\0',
        }
    }

    /// Declaration used in section headers
    pub const fn spec(self) -> &'static str {
        match self {
            Self::Space => "sep(32)",
            Self::Pipe => "sep(124)",
            Self::Tab => "sep(9)",
            Self::Semicolon => "sep(59)",
            Self::Nul => "sep(0)",
        }
    }
}

impl fmt::Display for Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec())
    }
}

impl FromStr for Separator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let code = s
            .trim()
            .strip_prefix("sep(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|code| code.parse::<u8>().ok())
            .ok_or_else(|| Error::config(format!("invalid separator '{s}'")))?;

        match code {
            32 => Ok(Self::Space),
            124 => Ok(Self::Pipe),
            9 => Ok(Self::Tab),
            59 => Ok(Self::Semicolon),
            0 => Ok(Self::Nul),
            other => Err(Error::config(format!("unsupported separator code {other}"))),
        }
    }
}

impl TryFrom<String> for Separator {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Separator> for String {
    fn from(sep: Separator) -> Self {
        sep.spec().to_string()
    }
}

/// Cache annotation of a section header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    /// When the cached data was produced (unix seconds)
    pub as_of: u64,
    /// Configured cache lifetime in seconds
    pub ttl: u64,
}

/// A section marker line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name
    pub name: String,
    /// Declared field separator, if any
    pub separator: Option<Separator>,
    /// Present only when the section content came from the cache
    pub cached: Option<CacheInfo>,
}

impl SectionHeader {
    /// Header with no separator declaration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            separator: None,
            cached: None,
        }
    }

    /// Set the separator declaration
    pub fn with_separator(mut self, separator: impl Into<Option<Separator>>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Annotate as served from cache
    pub fn with_cache(mut self, as_of: u64, ttl: u64) -> Self {
        self.cached = Some(CacheInfo { as_of, ttl });
        self
    }
}

impl fmt::Display for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<<<{}", self.name)?;
        if let Some(sep) = self.separator {
            write!(f, ":{sep}")?;
        }
        if let Some(CacheInfo { as_of, ttl }) = self.cached {
            write!(f, ":cached({as_of},{ttl})")?;
        }
        f.write_str(">>>")
    }
}

#[derive(Serialize)]
struct ConnectionTime<'a> {
    db_cstr: &'a str,
    connection_time: f64,
    error: Option<&'a str>,
}

/// Writes protocol sections to an output stream
pub struct Emitter<W: Write> {
    out: W,
}

impl<W: Write> Emitter<W> {
    /// Wrap an output stream
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write a section marker
    pub fn section(&mut self, header: &SectionHeader) -> Result<()> {
        writeln!(self.out, "{header}")?;
        Ok(())
    }

    /// Write preformatted content verbatim
    pub fn raw(&mut self, content: &str) -> Result<()> {
        self.out.write_all(content.as_bytes())?;
        Ok(())
    }

    /// Write one line
    pub fn line(&mut self, line: &str) -> Result<()> {
        writeln!(self.out, "{line}")?;
        Ok(())
    }

    /// Write one value as a single JSON line
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    /// Connect-time telemetry, emitted for every connection attempt
    pub fn connection_time(
        &mut self,
        backend: BackendKind,
        connection_string: &str,
        seconds: f64,
        error: Option<&str>,
    ) -> Result<()> {
        self.section(
            &SectionHeader::new(format!("{backend}_connection_time")).with_separator(Separator::Nul),
        )?;
        self.json(&ConnectionTime {
            db_cstr: connection_string,
            connection_time: seconds,
            error,
        })
    }

    /// Statistics of one statement execution on one connection
    pub fn statement_stats(
        &mut self,
        connection_string: &str,
        statement: &str,
        stats: &ExecutionStats,
    ) -> Result<()> {
        self.section(&SectionHeader::new(STATS_SECTION).with_separator(Separator::Nul))?;
        let payload = serde_json::json!({ connection_string: { statement: stats } });
        self.json(&payload)
    }

    /// Flush the underlying stream
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> fmt::Debug for Emitter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}
