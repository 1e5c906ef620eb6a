//! Append-only structured event log (one JSON record per line).
//!
//! Records are `{ts, level, event, data}`. Every record lands in `run.log`;
//! warnings and errors are also copied to `errors.log`. The log is purely
//! observational: write failures are reported through `tracing` and never
//! change control flow.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

pub const RUN_LOG: &str = "run.log";
pub const ERROR_LOG: &str = "errors.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    ts: String,
    level: EventLevel,
    event: &'a str,
    data: &'a Value,
}

/// JSONL sink. Use [`EventLog::disabled`] where no files should be written.
#[derive(Debug)]
pub struct EventLog {
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Log into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            write_lock: Mutex::new(()),
        })
    }

    /// Sink that only echoes through `tracing`.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn info(&self, event: &str, data: Value) {
        self.record(EventLevel::Info, event, &data);
    }

    pub fn warn(&self, event: &str, data: Value) {
        self.record(EventLevel::Warn, event, &data);
    }

    pub fn error(&self, event: &str, data: Value) {
        self.record(EventLevel::Error, event, &data);
    }

    fn record(&self, level: EventLevel, event: &str, data: &Value) {
        match level {
            EventLevel::Info => tracing::debug!(event, %data, "event"),
            EventLevel::Warn => tracing::warn!(event, %data, "event"),
            EventLevel::Error => tracing::error!(event, %data, "event"),
        }

        let Some(dir) = &self.dir else {
            return;
        };
        let record = EventRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            event,
            data,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(event, error = %e, "Failed to encode event record");
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::append(&dir.join(RUN_LOG), &line);
        if level != EventLevel::Info {
            Self::append(&dir.join(ERROR_LOG), &line);
        }
    }

    fn append(path: &Path, line: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to append event record");
        }
    }
}
