//! Point-in-time view of the whole system, built only from the shared files.
//!
//! Used by the master's periodic summary and by `hive status`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::Layout;
use crate::lease::LeaseStore;
use crate::status_log::{self, StatusLog, WorkerState};
use crate::task_store::{StoreError, TaskStatus, TaskStore};

/// Worker id the master uses for its own status entries.
pub const MASTER_ID: &str = "master";

/// Consecutive failures after which a worker is called out.
pub const ERROR_STREAK_WARN: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<WorkerState>,
    pub task_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<i64>,
    pub idle: bool,
    pub error_streak: usize,
    /// Task this worker currently holds a live lease on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
}

/// A task marked ASSIGNED that nobody holds a live lease for.
///
/// Usually a worker that died mid-run. Nothing requeues these; they are only
/// reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleAssignment {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    pub generated_at: DateTime<Utc>,
    pub tasks: TaskCounts,
    pub workers: Vec<WorkerSummary>,
    pub live_leases: usize,
    pub stale_assignments: Vec<StaleAssignment>,
}

impl SystemSummary {
    /// Build a summary for `worker_ids` plus any other worker seen in the log.
    pub fn collect(
        layout: &Layout,
        leases: &dyn LeaseStore,
        worker_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let tasks = TaskStore::new(layout.clone()).all()?;
        let log = StatusLog::new(layout);
        let view = log.scan_latest_per_worker();
        let streaks = log.error_streaks();
        let live = leases.live_leases();

        let mut counts = TaskCounts {
            total: tasks.len(),
            ..TaskCounts::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }

        let stale_assignments = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Assigned)
            .filter(|t| !live.iter().any(|l| l.resource_id == t.id))
            .map(|t| StaleAssignment {
                task_id: t.id.clone(),
                worker_id: t.assigned_worker_id.clone(),
                assigned_at: t.assigned_at,
            })
            .collect();

        let extras: BTreeSet<&String> = view
            .keys()
            .filter(|id| id.as_str() != MASTER_ID && !worker_ids.contains(id))
            .collect();

        let workers = worker_ids
            .iter()
            .chain(extras)
            .map(|id| {
                let latest = view.get(id);
                WorkerSummary {
                    worker_id: id.clone(),
                    state: latest.map(|e| e.state),
                    task_id: latest.map(|e| e.task_id.clone()).unwrap_or_default(),
                    message: latest.map(|e| e.message.clone()).unwrap_or_default(),
                    since: latest.map(|e| e.timestamp),
                    age_secs: latest.map(|e| now.signed_duration_since(e.timestamp).num_seconds()),
                    idle: status_log::is_idle(latest),
                    error_streak: streaks.get(id).copied().unwrap_or(0),
                    lease: live
                        .iter()
                        .find(|l| &l.holder_id == id)
                        .map(|l| l.resource_id.clone()),
                }
            })
            .collect();

        Ok(Self {
            generated_at: now,
            tasks: counts,
            workers,
            live_leases: live.len(),
            stale_assignments,
        })
    }

    /// Emit the summary as log events.
    pub fn log(&self) {
        let busy = self.workers.iter().filter(|w| w.lease.is_some()).count();
        tracing::info!(
            pending = self.tasks.pending,
            assigned = self.tasks.assigned,
            completed = self.tasks.completed,
            failed = self.tasks.failed,
            busy_workers = busy,
            live_leases = self.live_leases,
            "summary"
        );
        for stale in &self.stale_assignments {
            tracing::warn!(
                task_id = %stale.task_id,
                worker_id = stale.worker_id.as_deref().unwrap_or("-"),
                "assigned task has no live lease"
            );
        }
        for worker in self.workers.iter().filter(|w| w.error_streak >= ERROR_STREAK_WARN) {
            tracing::warn!(
                worker_id = %worker.worker_id,
                errors = worker.error_streak,
                "worker keeps failing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lease::FileLeaseStore;
    use crate::status_log::StatusEntry;
    use crate::task_store::{Outcome, TaskRepository};

    #[test]
    fn summarizes_tasks_workers_and_stale_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        let store = TaskStore::new(layout.clone());
        let leases = Arc::new(FileLeaseStore::new(layout.clone()));
        let log = StatusLog::new(&layout);

        for id in ["a", "b", "c", "d"] {
            store.add(Some(id), "p", 3).unwrap();
        }
        // a: running on w1
        assert!(leases.claim("a", "w1", 300));
        store.commit_assignment("a", "w1", Utc::now()).unwrap();
        log.append(&StatusEntry::new("w1", "a", WorkerState::Start, "started")).unwrap();
        // b: assigned to a worker that vanished
        store.commit_assignment("b", "ghost", Utc::now()).unwrap();
        // c: failed three times in a row on w2
        store.finish("c", &Outcome::Failed { error: "boom".into() }).unwrap();
        for _ in 0..3 {
            log.append(&StatusEntry::new("w2", "c", WorkerState::Error, "boom")).unwrap();
        }
        log.append(&StatusEntry::new(MASTER_ID, "", WorkerState::Done, "stopped")).unwrap();

        let ids = vec!["w1".to_string(), "w2".to_string(), "w3".to_string()];
        let summary = SystemSummary::collect(&layout, leases.as_ref(), &ids, Utc::now()).unwrap();

        assert_eq!(
            summary.tasks,
            TaskCounts { total: 4, pending: 1, assigned: 2, completed: 0, failed: 1 }
        );
        assert_eq!(summary.live_leases, 1);
        assert_eq!(summary.stale_assignments.len(), 1);
        assert_eq!(summary.stale_assignments[0].task_id, "b");
        assert_eq!(summary.stale_assignments[0].worker_id.as_deref(), Some("ghost"));

        let names: Vec<_> = summary.workers.iter().map(|w| w.worker_id.as_str()).collect();
        assert_eq!(names, ["w1", "w2", "w3"]);
        let w1 = &summary.workers[0];
        assert_eq!(w1.state, Some(WorkerState::Start));
        assert_eq!(w1.lease.as_deref(), Some("a"));
        assert!(!w1.idle);
        assert_eq!(summary.workers[1].error_streak, 3);
        assert!(summary.workers[2].idle);
        assert!(summary.workers[2].state.is_none());
    }
}
