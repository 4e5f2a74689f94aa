//! Shared, append-only status log and its read-side aggregation.
//!
//! Every process appends its own state transitions as JSON lines. Nothing is
//! ever rewritten; the "current" state of a worker is simply the last line it
//! appended, which the scanner recovers by reading the whole file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::{self, Layout};

/// Worker-visible lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerState {
    Start,
    Assigned,
    Wait,
    Done,
    Error,
    Help,
    Skip,
}

impl WorkerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerState::Start => "START",
            WorkerState::Assigned => "ASSIGNED",
            WorkerState::Wait => "WAIT",
            WorkerState::Done => "DONE",
            WorkerState::Error => "ERROR",
            WorkerState::Help => "HELP",
            WorkerState::Skip => "SKIP",
        }
    }

    /// States after which a worker may take new work.
    pub const fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Done | WorkerState::Error | WorkerState::Skip)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub worker_id: String,
    #[serde(default)]
    pub task_id: String,
    pub state: WorkerState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl StatusEntry {
    pub fn new(worker_id: &str, task_id: &str, state: WorkerState, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            task_id: task_id.to_string(),
            state,
            timestamp: Utc::now(),
            message: message.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Absent workers and workers whose last state is terminal are idle.
pub fn is_idle(entry: Option<&StatusEntry>) -> bool {
    entry.is_none_or(|e| e.state.is_terminal())
}

/// Handle on the shared `status.jsonl` file.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(layout: &Layout) -> Self {
        Self {
            path: layout.status_log(),
        }
    }

    /// Append one entry as a single line under an exclusive file lock.
    pub fn append(&self, entry: &StatusEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)?;
        layout::locked_append_line(&self.path, &line)
    }

    /// Append, logging instead of failing. Status lines are announcements;
    /// losing one never affects task ownership.
    pub fn broadcast(&self, entry: StatusEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::warn!(
                worker_id = %entry.worker_id,
                state = %entry.state,
                error = %e,
                "failed to append status entry"
            );
        }
    }

    /// Every well-formed entry, in append order.
    pub fn entries(&self) -> Vec<StatusEntry> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "status log unreadable");
                }
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, "status log read interrupted");
                    break;
                }
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<StatusEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::debug!(line = index + 1, error = %e, "skipping malformed status line");
                }
            }
        }
        entries
    }

    /// Last entry per worker by position in the file. Embedded timestamps are
    /// ignored: several entries can share one.
    pub fn scan_latest_per_worker(&self) -> HashMap<String, StatusEntry> {
        let mut latest = HashMap::new();
        for entry in self.entries() {
            latest.insert(entry.worker_id.clone(), entry);
        }
        latest
    }

    /// Number of consecutive ERROR entries at the end of each worker's history.
    pub fn error_streaks(&self) -> HashMap<String, usize> {
        let mut streaks: HashMap<String, usize> = HashMap::new();
        for entry in self.entries() {
            let streak = streaks.entry(entry.worker_id).or_default();
            match entry.state {
                WorkerState::Error => *streak += 1,
                // Announcements made on the worker's behalf don't break a streak.
                WorkerState::Assigned | WorkerState::Start => {}
                _ => *streak = 0,
            }
        }
        streaks
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use chrono::TimeDelta;

    use super::*;

    fn log() -> (tempfile::TempDir, StatusLog) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        (dir, StatusLog::new(&layout))
    }

    #[test]
    fn latest_entry_wins() {
        let (_dir, log) = log();
        log.append(&StatusEntry::new("w1", "t1", WorkerState::Start, "")).unwrap();
        log.append(&StatusEntry::new("w1", "t1", WorkerState::Done, "")).unwrap();
        assert_eq!(log.scan_latest_per_worker()["w1"].state, WorkerState::Done);
    }

    #[test]
    fn append_order_beats_embedded_timestamp() {
        let (_dir, log) = log();
        let now = Utc::now();
        for (i, state) in (0i64..).zip([WorkerState::Start, WorkerState::Wait, WorkerState::Error]) {
            let mut entry = StatusEntry::new("w1", "t1", state, format!("entry {i}"));
            // Later lines carry earlier timestamps.
            entry.timestamp = now - TimeDelta::seconds(i * 60);
            log.append(&entry).unwrap();
        }
        let latest = log.scan_latest_per_worker();
        assert_eq!(latest["w1"].state, WorkerState::Error);
        assert_eq!(latest["w1"].message, "entry 2");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (_dir, log) = log();
        log.append(&StatusEntry::new("w1", "t1", WorkerState::Start, "")).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&log.path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(b"{\"worker_id\": \"w1\", \"state\": \nnot json at all\n\n")
            })
            .unwrap();
        log.append(&StatusEntry::new("w2", "t2", WorkerState::Wait, "")).unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        let latest = log.scan_latest_per_worker();
        assert_eq!(latest["w1"].state, WorkerState::Start);
        assert_eq!(latest["w2"].state, WorkerState::Wait);
    }

    #[test]
    fn missing_log_scans_empty() {
        let (_dir, log) = log();
        assert!(log.scan_latest_per_worker().is_empty());
    }

    #[test]
    fn idle_states() {
        assert!(is_idle(None));
        for state in [WorkerState::Done, WorkerState::Error, WorkerState::Skip] {
            assert!(is_idle(Some(&StatusEntry::new("w", "t", state, ""))));
        }
        for state in [
            WorkerState::Start,
            WorkerState::Assigned,
            WorkerState::Wait,
            WorkerState::Help,
        ] {
            assert!(!is_idle(Some(&StatusEntry::new("w", "t", state, ""))));
        }
    }

    #[test]
    fn wire_format_uses_uppercase_states() {
        let entry = StatusEntry::new("w1", "t1", WorkerState::Assigned, "hi")
            .with_meta(serde_json::json!({"assigned_worker_id": "w1"}));
        let value: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["state"], "ASSIGNED");
        assert_eq!(value["meta"]["assigned_worker_id"], "w1");

        let bare = serde_json::to_value(StatusEntry::new("w1", "", WorkerState::Skip, "")).unwrap();
        assert!(bare.get("meta").is_none());
    }

    #[test]
    fn error_streak_counts_trailing_errors() {
        let (_dir, log) = log();
        for state in [
            WorkerState::Error,
            WorkerState::Done,
            WorkerState::Error,
            WorkerState::Assigned,
            WorkerState::Start,
            WorkerState::Error,
        ] {
            log.append(&StatusEntry::new("w1", "t", state, "")).unwrap();
        }
        log.append(&StatusEntry::new("w2", "t", WorkerState::Done, "")).unwrap();
        let streaks = log.error_streaks();
        assert_eq!(streaks["w1"], 2);
        assert_eq!(streaks["w2"], 0);
    }

    #[test]
    fn concurrent_appends_never_interleave() {
        let (_dir, log) = log();
        let log = Arc::new(log);
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..50 {
                        let msg = "x".repeat(512 + i);
                        log.append(&StatusEntry::new(&format!("w{w}"), "t", WorkerState::Wait, msg))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.entries().len(), 200);
    }
}
