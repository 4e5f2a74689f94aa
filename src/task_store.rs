//! The task document: `{"tasks": [...]}` in `tasks.json`.
//!
//! Readers load the file directly; it is only ever replaced by rename, so a
//! read sees one complete version. Writers serialize on an advisory lock on
//! `tasks.json.lock`, then read, modify and atomically replace the document.

use std::fs::{self, File, OpenOptions};
use std::io;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::layout::{self, Layout};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task record.
///
/// Records written into `tasks.json` by hand may carry only `id` and
/// `status`; creation order is then the position in the array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task store I/O: {0}")]
    Io(#[from] io::Error),

    #[error("task store is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {id} is {status}, not pending")]
    NotPending { id: String, status: TaskStatus },

    #[error("task {0} already exists")]
    Duplicate(String),

    #[error("priority {0} is outside 1..=5")]
    InvalidPriority(u8),
}

/// The task-store operations a dispatch cycle needs.
pub trait TaskRepository: Send + Sync {
    /// Pending tasks ordered by priority, then creation order.
    fn pending(&self) -> Result<Vec<Task>, StoreError>;

    /// Current status of one task.
    fn status(&self, task_id: &str) -> Result<TaskStatus, StoreError>;

    /// Move a pending task to ASSIGNED for `worker_id`.
    fn commit_assignment(
        &self,
        task_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Task, StoreError>;
}

/// How a worker's run of a task ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed { result_ref: String },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    layout: Layout,
}

/// Advisory lock on the task document, released on drop.
struct StoreLock(File);

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl TaskStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Create an empty document if none exists yet.
    pub fn ensure_exists(&self) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        if !self.layout.tasks_file().exists() {
            self.write(&TaskDocument::default())?;
        }
        Ok(())
    }

    /// Current document. A missing file is an empty store.
    pub fn load(&self) -> Result<TaskDocument, StoreError> {
        match fs::read_to_string(self.layout.tasks_file()) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TaskDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn all(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.load()?.tasks)
    }

    pub fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        self.load()?
            .tasks
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    /// Append a new pending task. Generates an id when none is given.
    pub fn add(&self, id: Option<&str>, prompt: &str, priority: u8) -> Result<Task, StoreError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(StoreError::InvalidPriority(priority));
        }
        self.update(|doc| {
            let id = match id {
                Some(id) if doc.tasks.iter().any(|t| t.id == id) => {
                    return Err(StoreError::Duplicate(id.to_string()));
                }
                Some(id) => id.to_string(),
                None => next_task_id(doc),
            };
            let task = Task {
                id,
                prompt: prompt.to_string(),
                priority,
                status: TaskStatus::Pending,
                assigned_worker_id: None,
                created_at: Some(Utc::now()),
                assigned_at: None,
                completed_at: None,
                result_ref: None,
                error: None,
            };
            doc.tasks.push(task.clone());
            Ok(task)
        })
    }

    /// Record how a worker's run ended.
    pub fn finish(&self, task_id: &str, outcome: &Outcome) -> Result<Task, StoreError> {
        self.update(|doc| {
            let task = find_mut(doc, task_id)?;
            task.completed_at = Some(Utc::now());
            match outcome {
                Outcome::Completed { result_ref } => {
                    task.status = TaskStatus::Completed;
                    task.result_ref = Some(result_ref.clone());
                    task.error = None;
                }
                Outcome::Failed { error } => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.clone());
                }
            }
            Ok(task.clone())
        })
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.layout.tasks_lock_file())?;
        file.lock_exclusive()?;
        Ok(StoreLock(file))
    }

    fn write(&self, doc: &TaskDocument) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(doc)?;
        layout::atomic_write(&self.layout.tasks_file(), &body)?;
        Ok(())
    }

    /// Locked read-modify-replace. Nothing is written when `f` fails.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut TaskDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let mut doc = self.load()?;
        let value = f(&mut doc)?;
        self.write(&doc)?;
        Ok(value)
    }
}

impl TaskRepository for TaskStore {
    fn pending(&self) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<Task> = self
            .load()?
            .tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        // Stable sort keeps creation order within a priority.
        pending.sort_by_key(|t| t.priority);
        Ok(pending)
    }

    fn status(&self, task_id: &str) -> Result<TaskStatus, StoreError> {
        Ok(self.get(task_id)?.status)
    }

    fn commit_assignment(
        &self,
        task_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.update(|doc| {
            let task = find_mut(doc, task_id)?;
            if task.status != TaskStatus::Pending {
                return Err(StoreError::NotPending {
                    id: task.id.clone(),
                    status: task.status,
                });
            }
            task.status = TaskStatus::Assigned;
            task.assigned_worker_id = Some(worker_id.to_string());
            task.assigned_at = Some(at);
            Ok(task.clone())
        })
    }
}

fn find_mut<'a>(doc: &'a mut TaskDocument, task_id: &str) -> Result<&'a mut Task, StoreError> {
    doc.tasks
        .iter_mut()
        .find(|t| t.id == task_id)
        .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
}

fn next_task_id(doc: &TaskDocument) -> String {
    let mut n = doc.tasks.len() + 1;
    loop {
        let candidate = format!("task-{n}");
        if !doc.tasks.iter().any(|t| t.id == candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        (dir, TaskStore::new(layout))
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.all().unwrap().is_empty());
        assert!(store.pending().unwrap().is_empty());
    }

    #[test]
    fn pending_sorted_by_priority_then_creation() {
        let (_dir, store) = store();
        store.add(Some("a"), "a", 3).unwrap();
        store.add(Some("b"), "b", 1).unwrap();
        store.add(Some("c"), "c", 3).unwrap();
        store.add(Some("d"), "d", 1).unwrap();
        let ids: Vec<_> = store.pending().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn add_validates_and_generates_ids() {
        let (_dir, store) = store();
        assert!(matches!(store.add(None, "x", 0), Err(StoreError::InvalidPriority(0))));
        assert!(matches!(store.add(None, "x", 6), Err(StoreError::InvalidPriority(6))));
        let first = store.add(None, "x", 2).unwrap();
        assert_eq!(first.id, "task-1");
        store.add(Some("task-2"), "y", 2).unwrap();
        assert_eq!(store.add(None, "z", 2).unwrap().id, "task-3");
        assert!(matches!(store.add(Some("task-1"), "x", 2), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn commit_assignment_only_from_pending() {
        let (_dir, store) = store();
        store.add(Some("t1"), "p", 1).unwrap();
        let at = Utc::now();
        let task = store.commit_assignment("t1", "w1", at).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_worker_id.as_deref(), Some("w1"));
        assert_eq!(task.assigned_at, Some(at));

        let err = store.commit_assignment("t1", "w2", at).unwrap_err();
        assert!(matches!(err, StoreError::NotPending { status: TaskStatus::Assigned, .. }));
        assert_eq!(store.get("t1").unwrap().assigned_worker_id.as_deref(), Some("w1"));

        assert!(matches!(
            store.commit_assignment("nope", "w1", at),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn finish_records_outcome() {
        let (_dir, store) = store();
        store.add(Some("t1"), "p", 1).unwrap();
        store.add(Some("t2"), "p", 1).unwrap();
        store
            .finish("t1", &Outcome::Completed { result_ref: "results/t1.md".into() })
            .unwrap();
        store.finish("t2", &Outcome::Failed { error: "boom".into() }).unwrap();

        let t1 = store.get("t1").unwrap();
        assert_eq!(t1.status, TaskStatus::Completed);
        assert_eq!(t1.result_ref.as_deref(), Some("results/t1.md"));
        assert!(t1.completed_at.is_some());
        let t2 = store.get("t2").unwrap();
        assert_eq!(t2.status, TaskStatus::Failed);
        assert_eq!(t2.error.as_deref(), Some("boom"));
    }

    #[test]
    fn status_wire_names() {
        let (_dir, store) = store();
        store.add(Some("t1"), "p", 1).unwrap();
        store.commit_assignment("t1", "w1", Utc::now()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.layout.tasks_file()).unwrap()).unwrap();
        assert_eq!(raw["tasks"][0]["status"], "ASSIGNED");
        assert_eq!(raw["tasks"][0]["assigned_worker_id"], "w1");
        assert!(raw["tasks"][0].get("error").is_none());
    }

    #[test]
    fn corrupt_store_is_never_overwritten() {
        let (_dir, store) = store();
        fs::write(store.layout.tasks_file(), "{oops").unwrap();
        assert!(matches!(store.add(None, "x", 1), Err(StoreError::Corrupt(_))));
        assert_eq!(fs::read_to_string(store.layout.tasks_file()).unwrap(), "{oops");
    }

    #[test]
    fn accepts_documents_with_minimal_fields() {
        let (_dir, store) = store();
        fs::write(
            store.layout.tasks_file(),
            r#"{"tasks":[{"id":"t1","prompt":"p","priority":1,"status":"pending","created_at":"2026-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert_eq!(store.pending().unwrap()[0].id, "t1");
    }

    #[test]
    fn hand_written_records_load_with_defaults() {
        let (_dir, store) = store();
        fs::write(
            store.layout.tasks_file(),
            r#"{"tasks":[{"id":"t1","status":"pending","priority":1},{"id":"t2","status":"pending"}]}"#,
        )
        .unwrap();
        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "t1");
        assert_eq!(pending[1].priority, DEFAULT_PRIORITY);
        assert!(pending[0].prompt.is_empty());
        assert!(pending[0].created_at.is_none());

        store.commit_assignment("t1", "w1", Utc::now()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.layout.tasks_file()).unwrap()).unwrap();
        assert!(raw["tasks"][0].get("created_at").is_none());
        assert_eq!(raw["tasks"][0]["status"], "ASSIGNED");
    }
}
