//! Per-worker instruction streams.
//!
//! The dispatcher appends `RUN_TASK` lines to `mailbox/<worker>.jsonl`; the
//! worker reads them in order and remembers how far it got in
//! `offsets/<worker>.json`. The offset is persisted *before* an instruction is
//! handed to the caller, so an instruction is returned at most once per worker
//! even across crashes. A crash between persisting and finishing the task
//! drops that task for this worker.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::{self, Layout};
use crate::lease::LeaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "RUN_TASK")]
    RunTask,
}

/// What a worker needs to run a task without touching the task store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(rename = "ts")]
    pub sequence_ts: DateTime<Utc>,
    pub task_id: String,
    pub action: Action,
    #[serde(default)]
    pub payload: TaskPayload,
}

impl Instruction {
    pub fn run_task(task_id: &str, payload: TaskPayload) -> Self {
        Self {
            sequence_ts: Utc::now(),
            task_id: task_id.to_string(),
            action: Action::RunTask,
            payload,
        }
    }
}

/// Persisted read position of one worker's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub offset: usize,
    pub updated_at: DateTime<Utc>,
}

/// Write side, used by the dispatcher.
#[derive(Debug, Clone)]
pub struct Mailboxes {
    layout: Layout,
}

impl Mailboxes {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Append one instruction line to `worker_id`'s mailbox. No acknowledgement.
    ///
    /// Appends from concurrent dispatchers serialize on the file lock, so each
    /// line lands whole.
    pub fn deliver(&self, worker_id: &str, instruction: &Instruction) -> io::Result<()> {
        let line = serde_json::to_string(instruction)?;
        layout::locked_append_line(&self.layout.mailbox_file(worker_id), &line)
    }
}

/// Read side, owned by exactly one worker process.
pub struct MailboxReader {
    worker_id: String,
    mailbox_path: PathBuf,
    offset_path: PathBuf,
    offset: usize,
    leases: Arc<dyn LeaseStore>,
}

impl MailboxReader {
    /// Open a worker's mailbox, resuming from its persisted offset.
    pub fn open(layout: &Layout, worker_id: &str, leases: Arc<dyn LeaseStore>) -> Self {
        let offset_path = layout.offset_file(worker_id);
        let offset = load_offset(&offset_path);
        tracing::debug!(worker_id, offset, "mailbox opened");
        Self {
            worker_id: worker_id.to_string(),
            mailbox_path: layout.mailbox_file(worker_id),
            offset_path,
            offset,
            leases,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Next deliverable instruction, if any. Never blocks.
    ///
    /// Instructions for tasks whose lease this worker no longer holds are
    /// consumed and discarded.
    pub fn poll(&mut self) -> Option<Instruction> {
        let bytes = match fs::read(&self.mailbox_path) {
            Ok(b) => b,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "mailbox unreadable");
                }
                return None;
            }
        };
        let content = String::from_utf8_lossy(&bytes);

        for (index, line) in layout::complete_lines(&content).enumerate().skip(self.offset) {
            let instruction = match serde_json::from_str::<Instruction>(line) {
                Ok(i) => i,
                Err(e) => {
                    tracing::debug!(worker_id = %self.worker_id, line = index + 1, error = %e, "skipping unreadable mailbox line");
                    continue;
                }
            };

            let next = index + 1;
            if let Err(e) = persist_offset(&self.offset_path, next) {
                // Without a durable offset the instruction could run twice.
                tracing::warn!(worker_id = %self.worker_id, error = %e, "cannot persist mailbox offset");
                return None;
            }
            self.offset = next;

            if !self.leases.holds(&instruction.task_id, &self.worker_id) {
                tracing::info!(
                    worker_id = %self.worker_id,
                    task_id = %instruction.task_id,
                    "discarding instruction, lease not held"
                );
                continue;
            }
            return Some(instruction);
        }
        None
    }

    /// Poll until an instruction arrives or `timeout` elapses.
    pub fn poll_timeout(&mut self, timeout: Duration) -> Option<Instruction> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(instruction) = self.poll() {
                return Some(instruction);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

fn load_offset(path: &std::path::Path) -> usize {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return 0,
    };
    match serde_json::from_str::<OffsetRecord>(&contents) {
        Ok(record) => record.offset,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt offset record, starting from 0");
            0
        }
    }
}

fn persist_offset(path: &std::path::Path, offset: usize) -> io::Result<()> {
    let record = OffsetRecord {
        offset,
        updated_at: Utc::now(),
    };
    layout::atomic_write(path, &serde_json::to_vec(&record)?)
}
