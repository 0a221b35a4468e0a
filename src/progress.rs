use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Fetch,
    Verify,
    Process,
    Store,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Fetch => "Fetch",
            Phase::Verify => "Verify",
            Phase::Process => "Process",
            Phase::Store => "Store",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase={}; {}", self.phase.label(), self.message)?;
        if let Some(elapsed) = self.elapsed {
            write!(f, " ({} ms)", elapsed.as_millis())?;
        }
        Ok(())
    }
}

/// Receives progress from a load. Sinks are shared with fetch workers.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);

    /// Human-facing text printed after a successful load (license, citation).
    fn notice(&self, _line: &str) {}
}

/// Observability level. Never affects what gets loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Verbosity {
    Silent,
    #[default]
    Plain,
    Rich,
}

impl TryFrom<u8> for Verbosity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Verbosity::Silent),
            1 => Ok(Verbosity::Plain),
            2 => Ok(Verbosity::Rich),
            other => Err(format!("verbosity must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<Verbosity> for u8 {
    fn from(value: Verbosity) -> Self {
        match value {
            Verbosity::Silent => 0,
            Verbosity::Plain => 1,
            Verbosity::Rich => 2,
        }
    }
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct PlainSink;

impl ProgressSink for PlainSink {
    fn event(&self, event: ProgressEvent) {
        let _ = writeln!(io::stderr(), "{event}");
    }

    fn notice(&self, line: &str) {
        let _ = writeln!(io::stderr(), "{line}");
    }
}

pub struct RichSink {
    started: Instant,
}

impl RichSink {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for RichSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for RichSink {
    fn event(&self, event: ProgressEvent) {
        let clock = self.started.elapsed().as_secs();
        let stamp = format!("{:02}:{:02}", clock / 60, clock % 60);
        let phase = match event.phase {
            Phase::Resolve => event.phase.label().cyan(),
            Phase::Fetch => event.phase.label().blue(),
            Phase::Verify => event.phase.label().yellow(),
            Phase::Process => event.phase.label().magenta(),
            Phase::Store => event.phase.label().green(),
        };
        let took = event
            .elapsed
            .map(|e| format!(" {}", format!("{} ms", e.as_millis()).dark_grey()))
            .unwrap_or_default();
        let _ = writeln!(
            io::stderr(),
            "{} {:>8} {}{took}",
            stamp.dark_grey(),
            phase.bold(),
            event.message
        );
    }

    fn notice(&self, line: &str) {
        let _ = writeln!(io::stderr(), "{}", line.italic());
    }
}

pub fn sink_for(verbosity: Verbosity) -> Box<dyn ProgressSink> {
    match verbosity {
        Verbosity::Silent => Box::new(NoopSink),
        Verbosity::Plain => Box::new(PlainSink),
        Verbosity::Rich => Box::new(RichSink::new()),
    }
}
