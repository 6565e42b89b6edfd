use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, BufReader as TokioBufReader};
use tokio::sync::mpsc;

use crate::process::ProcessEvent;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Entries kept per service before the oldest are dropped.
pub const LOG_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

/// A log entry tagged with the service it belongs to, as published to
/// live subscribers.
#[derive(Debug, Clone)]
pub struct ServiceLog {
    pub service_id: String,
    pub entry: LogEntry,
}

// ---------------------------------------------------------------------------
// LogBuffer: bounded FIFO of entries
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(LOG_CAPACITY)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// spawn_output_reader: tokio task that reads piped child output
// ---------------------------------------------------------------------------

pub fn spawn_output_reader(
    service_id: String,
    generation: u64,
    level: LogLevel,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_output_reader(&service_id, generation, level, reader, &events).await {
            tracing::debug!(service = %service_id, "output reader stopped: {e}");
        }
    })
}

async fn run_output_reader(
    service_id: &str,
    generation: u64,
    level: LogLevel,
    reader: impl tokio::io::AsyncRead + Unpin,
    events: &mpsc::UnboundedSender<ProcessEvent>,
) -> std::io::Result<()> {
    let mut buf_reader = TokioBufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = buf_reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break; // EOF, child closed the pipe
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        if text.is_empty() {
            continue;
        }

        let event = ProcessEvent::Output {
            service_id: service_id.to_string(),
            generation,
            level,
            line: text.to_string(),
        };
        if events.send(event).is_err() {
            break; // supervisor is gone
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
