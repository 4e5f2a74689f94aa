//! One dispatch cycle: SCAN → SELECT → CLAIM → DELIVER → COMMIT.
//!
//! CLAIM is the only step where two dispatchers can collide, and a lease can
//! only be created once while it is live, so at most one DELIVER per task
//! succeeds while that lease is held. A failed DELIVER or COMMIT releases the
//! lease again before the pairing is reported; it is never left to outlive a
//! task that was not assigned.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::lease::LeaseStore;
use crate::mailbox::{Instruction, Mailboxes, TaskPayload};
use crate::status_log::{self, StatusEntry, StatusLog, WorkerState};
use crate::task_store::{StoreError, Task, TaskRepository, TaskStatus};

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: String,
    pub worker_id: String,
}

/// A pairing that was claimed and then unwound.
#[derive(Debug)]
pub enum Rollback {
    Deliver {
        task_id: String,
        worker_id: String,
        error: String,
        released: bool,
    },
    Commit {
        task_id: String,
        worker_id: String,
        error: String,
        released: bool,
    },
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub pending_tasks: usize,
    pub idle_workers: usize,
    pub assigned: Vec<Assignment>,
    /// Tasks whose lease was already held by someone else.
    pub contended: Vec<String>,
    pub rolled_back: Vec<Rollback>,
}

enum Step {
    Assigned(Assignment),
    Contended,
    RolledBack(Rollback),
}

pub struct Dispatcher {
    leases: Arc<dyn LeaseStore>,
    tasks: Arc<dyn TaskRepository>,
    log: StatusLog,
    mailboxes: Mailboxes,
    workers: Vec<String>,
    ttl_seconds: u64,
}

impl Dispatcher {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        tasks: Arc<dyn TaskRepository>,
        log: StatusLog,
        mailboxes: Mailboxes,
        workers: Vec<String>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            leases,
            tasks,
            log,
            mailboxes,
            workers,
            ttl_seconds,
        }
    }

    /// Pair pending tasks with idle workers until either runs out.
    ///
    /// Contention and rollbacks are reported, not returned as errors; the next
    /// cycle simply tries again. Only an unreadable task store is an error.
    pub fn run_cycle(&self) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();

        // SCAN
        let pending = self.tasks.pending()?;
        report.pending_tasks = pending.len();
        if pending.is_empty() {
            return Ok(report);
        }

        let live = self.leases.live_leases();
        let leased_tasks: HashSet<&str> = live.iter().map(|l| l.resource_id.as_str()).collect();
        let busy_workers: HashSet<&str> = live.iter().map(|l| l.holder_id.as_str()).collect();
        let view = self.log.scan_latest_per_worker();

        // SELECT
        let mut idle: VecDeque<&str> = self
            .workers
            .iter()
            .map(String::as_str)
            .filter(|w| !busy_workers.contains(w) && available(view.get(*w)))
            .collect();
        report.idle_workers = idle.len();

        for task in pending.iter().filter(|t| !leased_tasks.contains(t.id.as_str())) {
            if idle.is_empty() {
                break;
            }
            self.offer(task, &mut idle, &mut report);
        }

        Ok(report)
    }

    /// Offer one task to the idle workers in order.
    ///
    /// A worker whose mailbox refuses the instruction is dropped for the rest
    /// of the cycle and the same task goes to the next idle worker. Contention
    /// and commit failures move on to the next task.
    fn offer(&self, task: &Task, idle: &mut VecDeque<&str>, report: &mut DispatchReport) {
        while let Some(&worker_id) = idle.front() {
            match self.assign(task, worker_id) {
                Step::Assigned(assignment) => {
                    idle.pop_front();
                    report.assigned.push(assignment);
                    return;
                }
                Step::Contended => {
                    report.contended.push(task.id.clone());
                    return;
                }
                Step::RolledBack(rollback @ Rollback::Deliver { .. }) => {
                    idle.pop_front();
                    report.rolled_back.push(rollback);
                }
                Step::RolledBack(rollback) => {
                    report.rolled_back.push(rollback);
                    return;
                }
            }
        }
    }

    fn assign(&self, task: &Task, worker_id: &str) -> Step {
        // CLAIM. Create-only: a live lease, even one naming this worker,
        // means another dispatcher is mid-assignment.
        if !self.leases.claim(&task.id, worker_id, self.ttl_seconds) {
            tracing::debug!(task_id = %task.id, worker_id, "task already leased");
            return Step::Contended;
        }
        // The snapshot may predate a whole assign/run/release by someone else.
        match self.tasks.status(&task.id) {
            Ok(TaskStatus::Pending) => {}
            Ok(status) => {
                self.leases.release(&task.id, worker_id);
                tracing::debug!(task_id = %task.id, %status, "task no longer pending");
                return Step::Contended;
            }
            Err(e) => {
                let released = self.leases.release(&task.id, worker_id);
                tracing::warn!(task_id = %task.id, worker_id, error = %e, released, "cannot confirm task status");
                return Step::RolledBack(Rollback::Commit {
                    task_id: task.id.clone(),
                    worker_id: worker_id.to_string(),
                    error: e.to_string(),
                    released,
                });
            }
        }

        // DELIVER
        let instruction = Instruction::run_task(
            &task.id,
            TaskPayload {
                prompt: task.prompt.clone(),
                priority: task.priority,
            },
        );
        if let Err(e) = self.mailboxes.deliver(worker_id, &instruction) {
            let released = self.leases.release(&task.id, worker_id);
            tracing::warn!(task_id = %task.id, worker_id, error = %e, released, "delivery failed, lease released");
            return Step::RolledBack(Rollback::Deliver {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
                error: e.to_string(),
                released,
            });
        }

        // COMMIT
        let assigned_at = Utc::now();
        if let Err(e) = self.tasks.commit_assignment(&task.id, worker_id, assigned_at) {
            let released = self.leases.release(&task.id, worker_id);
            tracing::warn!(task_id = %task.id, worker_id, error = %e, released, "commit failed");
            return Step::RolledBack(Rollback::Commit {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
                error: e.to_string(),
                released,
            });
        }

        // ANNOUNCE
        self.log.broadcast(
            StatusEntry::new(
                worker_id,
                &task.id,
                WorkerState::Assigned,
                format!("assigned {}", task.id),
            )
            .with_meta(json!({
                "assigned_worker_id": worker_id,
                "priority": task.priority,
                "assigned_at": assigned_at,
            })),
        );
        tracing::info!(task_id = %task.id, worker_id, priority = task.priority, "task assigned");

        Step::Assigned(Assignment {
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
        })
    }
}

/// Whether a worker without a live lease can take work.
///
/// DELIVER precedes the ASSIGNED announcement, so a quick worker can append
/// DONE before the master appends ASSIGNED. An ASSIGNED entry from a worker
/// that holds no lease is such a late announcement.
fn available(latest: Option<&StatusEntry>) -> bool {
    status_log::is_idle(latest) || latest.is_some_and(|e| e.state == WorkerState::Assigned)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;
    use std::sync::Barrier;
    use std::thread;

    use chrono::DateTime;

    use super::*;
    use crate::layout::Layout;
    use crate::lease::FileLeaseStore;
    use crate::task_store::{Outcome, TaskStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: Layout,
        leases: Arc<FileLeaseStore>,
        store: Arc<TaskStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        Fixture {
            leases: Arc::new(FileLeaseStore::new(layout.clone())),
            store: Arc::new(TaskStore::new(layout.clone())),
            layout,
            _dir: dir,
        }
    }

    fn dispatcher(fx: &Fixture, tasks: Arc<dyn TaskRepository>, workers: &[&str]) -> Dispatcher {
        Dispatcher::new(
            fx.leases.clone(),
            tasks,
            StatusLog::new(&fx.layout),
            Mailboxes::new(fx.layout.clone()),
            workers.iter().map(|w| w.to_string()).collect(),
            300,
        )
    }

    fn mailbox_lines(fx: &Fixture, worker: &str) -> usize {
        fs::read_to_string(fx.layout.mailbox_file(worker))
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }

    /// Delegates reads to the real store but refuses every commit.
    struct BrokenCommits(Arc<TaskStore>);

    impl TaskRepository for BrokenCommits {
        fn pending(&self) -> Result<Vec<Task>, StoreError> {
            self.0.pending()
        }

        fn status(&self, task_id: &str) -> Result<TaskStatus, StoreError> {
            self.0.status(task_id)
        }

        fn commit_assignment(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<Task, StoreError> {
            Err(StoreError::Io(io::Error::other("disk full")))
        }
    }

    #[test]
    fn repeated_cycles_assign_once() {
        let fx = fixture();
        fx.store.add(Some("t1"), "prompt", 1).unwrap();
        let d = dispatcher(&fx, fx.store.clone(), &["w1", "w2"]);

        let first = d.run_cycle().unwrap();
        assert_eq!(first.assigned.len(), 1);
        assert_eq!(d.run_cycle().unwrap().assigned.len(), 0);
        assert_eq!(d.run_cycle().unwrap().assigned.len(), 0);

        let task = fx.store.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        let owner = task.assigned_worker_id.unwrap();
        assert_eq!(owner, first.assigned[0].worker_id);
        assert_eq!(fx.leases.read("t1").unwrap().holder_id, owner);
        assert_eq!(mailbox_lines(&fx, "w1") + mailbox_lines(&fx, "w2"), 1);

        let view = StatusLog::new(&fx.layout).scan_latest_per_worker();
        let entry = &view[&owner];
        assert_eq!(entry.state, WorkerState::Assigned);
        assert_eq!(entry.meta.as_ref().unwrap()["assigned_worker_id"], owner.as_str());
    }

    #[test]
    fn orders_by_priority_and_skips_busy_workers() {
        let fx = fixture();
        fx.store.add(Some("low"), "p", 5).unwrap();
        fx.store.add(Some("high"), "p", 1).unwrap();
        fx.store.add(Some("mid"), "p", 3).unwrap();
        let log = StatusLog::new(&fx.layout);
        log.append(&StatusEntry::new("w2", "other", WorkerState::Start, "")).unwrap();

        let d = dispatcher(&fx, fx.store.clone(), &["w1", "w2", "w3"]);
        let report = d.run_cycle().unwrap();
        assert_eq!(report.idle_workers, 2);
        assert_eq!(
            report.assigned,
            vec![
                Assignment { task_id: "high".into(), worker_id: "w1".into() },
                Assignment { task_id: "mid".into(), worker_id: "w3".into() },
            ]
        );
        assert_eq!(fx.store.get("low").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn worker_holding_a_lease_is_not_idle() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        assert!(fx.leases.acquire("elsewhere", "w1", 300));
        let d = dispatcher(&fx, fx.store.clone(), &["w1"]);
        let report = d.run_cycle().unwrap();
        assert_eq!(report.idle_workers, 0);
        assert!(report.assigned.is_empty());
    }

    #[test]
    fn late_assigned_announcement_does_not_strand_worker() {
        let fx = fixture();
        fx.store.add(Some("t2"), "p", 1).unwrap();
        let log = StatusLog::new(&fx.layout);
        log.append(&StatusEntry::new("w1", "t1", WorkerState::Done, "")).unwrap();
        log.append(&StatusEntry::new("w1", "t1", WorkerState::Assigned, "")).unwrap();

        let d = dispatcher(&fx, fx.store.clone(), &["w1"]);
        let report = d.run_cycle().unwrap();
        assert_eq!(report.assigned.len(), 1);
    }

    #[test]
    fn leased_task_is_passed_over() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        fx.store.add(Some("t2"), "p", 2).unwrap();
        assert!(fx.leases.acquire("t1", "ghost", 300));
        let d = dispatcher(&fx, fx.store.clone(), &["w1"]);
        let report = d.run_cycle().unwrap();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].task_id, "t2");
    }

    #[test]
    fn commit_failure_releases_lease() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        let d = dispatcher(&fx, Arc::new(BrokenCommits(fx.store.clone())), &["w1"]);

        let report = d.run_cycle().unwrap();
        assert!(report.assigned.is_empty());
        assert!(matches!(
            report.rolled_back.as_slice(),
            [Rollback::Commit { released: true, .. }]
        ));
        assert!(fx.leases.read("t1").is_none());
        assert!(fx.leases.acquire("t1", "w2", 300));
        assert_eq!(fx.store.get("t1").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn delivery_failure_releases_lease() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        // A directory where the mailbox file should be makes the append fail.
        fs::create_dir_all(fx.layout.mailbox_file("w1")).unwrap();
        let d = dispatcher(&fx, fx.store.clone(), &["w1", "w2"]);

        let report = d.run_cycle().unwrap();
        assert!(matches!(
            report.rolled_back.as_slice(),
            [Rollback::Deliver { released: true, .. }]
        ));
        // The task still went out this cycle, to the next idle worker.
        assert_eq!(
            report.assigned,
            vec![Assignment { task_id: "t1".into(), worker_id: "w2".into() }]
        );
    }

    #[test]
    fn broken_mailbox_never_starves_a_task() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        fx.store.add(Some("t2"), "p", 2).unwrap();
        fs::create_dir_all(fx.layout.mailbox_file("w1")).unwrap();
        let d = dispatcher(&fx, fx.store.clone(), &["w1", "w2"]);

        let first = d.run_cycle().unwrap();
        assert_eq!(
            first.assigned,
            vec![Assignment { task_id: "t1".into(), worker_id: "w2".into() }]
        );

        // w2 is busy and w1 still cannot take deliveries.
        for _ in 0..2 {
            let report = d.run_cycle().unwrap();
            assert!(report.assigned.is_empty());
            assert_eq!(report.rolled_back.len(), 1);
            assert!(fx.leases.read("t2").is_none());
        }

        // w2 finishes t1 and picks up t2 on the next cycle.
        fx.store
            .finish("t1", &Outcome::Completed { result_ref: "results/t1.md".into() })
            .unwrap();
        assert!(fx.leases.release("t1", "w2"));
        StatusLog::new(&fx.layout)
            .append(&StatusEntry::new("w2", "t1", WorkerState::Done, ""))
            .unwrap();

        let last = d.run_cycle().unwrap();
        assert_eq!(
            last.assigned,
            vec![Assignment { task_id: "t2".into(), worker_id: "w2".into() }]
        );
        assert_eq!(fx.store.get("t2").unwrap().status, TaskStatus::Assigned);
        assert_eq!(mailbox_lines(&fx, "w2"), 2);
    }

    #[test]
    fn hand_written_store_dispatches_once() {
        let fx = fixture();
        fs::write(
            fx.layout.tasks_file(),
            r#"{"tasks":[{"id":"t1","status":"pending","priority":1}]}"#,
        )
        .unwrap();
        let d = dispatcher(&fx, fx.store.clone(), &["w1", "w2"]);

        let runs: Vec<usize> = (0..3).map(|_| d.run_cycle().unwrap().assigned.len()).collect();
        assert_eq!(runs, vec![1, 0, 0]);
        assert_eq!(fx.store.get("t1").unwrap().status, TaskStatus::Assigned);
    }

    #[test]
    fn concurrent_dispatchers_assign_once() {
        let fx = fixture();
        fx.store.add(Some("t1"), "p", 1).unwrap();
        let contenders = 6;
        let barrier = Arc::new(Barrier::new(contenders));
        let dispatchers: Vec<_> = (0..contenders)
            .map(|_| Arc::new(dispatcher(&fx, fx.store.clone(), &["w1", "w2", "w3"])))
            .collect();

        let handles: Vec<_> = dispatchers
            .into_iter()
            .map(|d| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..3).map(|_| d.run_cycle().unwrap().assigned.len()).sum::<usize>()
                })
            })
            .collect();
        let successes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(successes, 1);
        let task = fx.store.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        let owner = task.assigned_worker_id.unwrap();
        assert!(fx.leases.holds("t1", &owner));
    }
}
