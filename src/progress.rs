//! Sync progress reporting.
//!
//! Progress goes to **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for one scope's sync.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestProgressEvent {
    /// The source is being walked; total unknown.
    Discovering { scope: String },
    /// `n` of `total` items persisted (or failed).
    Ingesting { scope: String, n: u64, total: u64 },
    /// Stale documents soft-deleted by cleanup.
    Cleanup { scope: String, deactivated: u64 },
}

pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// `sync notes  ingesting  1,234 / 5,000 items`
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Discovering { scope } => {
                format!("sync {}  discovering...\n", scope)
            }
            IngestProgressEvent::Ingesting { scope, n, total } => format!(
                "sync {}  ingesting  {} / {} items\n",
                scope,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Cleanup { scope, deactivated } => format!(
                "sync {}  cleanup  {} deactivated\n",
                scope,
                format_number(*deactivated)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { scope } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "discovering"
            }),
            IngestProgressEvent::Ingesting { scope, n, total } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            IngestProgressEvent::Cleanup { scope, deactivated } => serde_json::json!({
                "event": "progress",
                "scope": scope,
                "phase": "cleanup",
                "deactivated": deactivated
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn parse(mode: &str) -> anyhow::Result<Self> {
        match mode {
            "off" => Ok(Self::Off),
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown progress mode: {}. Use human, json, or off.", other),
        }
    }

    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
