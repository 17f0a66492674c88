//! Per-call log for debugging and troubleshooting.
//!
//! Every call gets one [`CallRecord`] holding its persona, timing, outcome,
//! traffic counters and a timeline of notable events. Finished records are kept
//! in memory up to the configured retention amount.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Hard cap for records kept in memory, whatever the retention setting.
const HARD_MAX_RECORDS: usize = 1000;

/// A single timeline entry within a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Log level for entries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// How a call ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    InProgress,
    /// Hung up locally after connecting
    Completed,
    /// Hung up before the session opened
    Cancelled,
    /// Remote side ended the session
    RemoteClosed,
    Failed,
}

/// Everything recorded about one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub persona_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<u64>,
    pub outcome: CallOutcome,
    pub error_message: Option<String>,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    /// Frames captured while the session could not send
    pub chunks_dropped: u64,
    pub playback_failures: u64,
    pub entries: Vec<LogEntry>,
}

impl CallRecord {
    pub fn new(persona_id: String, model: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            persona_id,
            model,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            total_duration_ms: None,
            outcome: CallOutcome::InProgress,
            error_message: None,
            chunks_sent: 0,
            chunks_received: 0,
            chunks_dropped: 0,
            playback_failures: 0,
            entries: Vec::new(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn mark_connected(&mut self) {
        if self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
    }

    /// Close the record. Only the first outcome sticks.
    pub fn finish(&mut self, outcome: CallOutcome, error: Option<String>) {
        if self.outcome != CallOutcome::InProgress {
            return;
        }
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        self.outcome = outcome;
        if error.is_some() {
            self.error_message = error;
        }
        self.total_duration_ms =
            Some((ended_at - self.started_at).num_milliseconds().max(0) as u64);
    }
}

/// Thread-safe call log store
#[derive(Debug, Clone)]
pub struct CallLogStore {
    records: Arc<Mutex<VecDeque<CallRecord>>>,
    current: Arc<Mutex<Option<CallRecord>>>,
    retention: usize,
}

impl CallLogStore {
    pub fn new(retention: usize) -> Self {
        let retention = retention.clamp(1, HARD_MAX_RECORDS);
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(retention))),
            current: Arc::new(Mutex::new(None)),
            retention,
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Begin a record for a new call and return its id. An unfinished previous
    /// record is closed as cancelled.
    pub fn start_call(&self, persona_id: &str, model: &str) -> String {
        let record = CallRecord::new(persona_id.to_string(), model.to_string());
        let id = record.id.clone();

        let previous = match self.current.lock() {
            Ok(mut current) => current.replace(record),
            Err(_) => return id,
        };
        if let Some(mut existing) = previous {
            existing.finish(CallOutcome::Cancelled, None);
            self.store(existing);
        }
        id
    }

    /// Mutate the in-progress record, if any.
    pub fn with_current<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut CallRecord) -> R,
    {
        let mut current = self.current.lock().ok()?;
        current.as_mut().map(f)
    }

    /// Mutate the in-progress record only if it belongs to call `id`.
    pub fn with_call<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut CallRecord) -> R,
    {
        let mut current = self.current.lock().ok()?;
        current.as_mut().filter(|r| r.id == id).map(f)
    }

    /// Move the in-progress record for call `id` to the finished list.
    pub fn complete_call(&self, id: &str) {
        let record = match self.current.lock() {
            Ok(mut current) if current.as_ref().is_some_and(|r| r.id == id) => current.take(),
            _ => None,
        };
        if let Some(record) = record {
            self.store(record);
        }
    }

    fn store(&self, record: CallRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push_back(record);
            while records.len() > self.retention {
                records.pop_front();
            }
        }
    }

    /// All records, most recent first, including the call in progress.
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<CallRecord> {
        let mut result: Vec<CallRecord> = self
            .records
            .lock()
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default();

        if let Ok(current) = self.current.lock() {
            if let Some(c) = current.as_ref() {
                result.push(c.clone());
            }
        }

        result.reverse();
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        result
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl Default for CallLogStore {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_CALL_LOG_RETENTION)
    }
}
