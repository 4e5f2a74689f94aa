//! Worker loop: read the mailbox, run each task under a heartbeat, record the
//! outcome, release the lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::backend::{Backend, ExecuteParams, Usage};
use crate::config::Config;
use crate::error;
use crate::heartbeat::spawn_heartbeat;
use crate::layout::{self, Layout};
use crate::lease::LeaseStore;
use crate::mailbox::{Instruction, MailboxReader};
use crate::shutdown::Shutdown;
use crate::status_log::{StatusEntry, StatusLog, WorkerState};
use crate::task_store::{Outcome, TaskStore};

/// How long to wait for the heartbeat thread after cancelling it.
const HEARTBEAT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub execute: ExecuteParams,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            execute: ExecuteParams::from_config(&config.backend),
        }
    }
}

/// How one task run ended, from the worker's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRun {
    Completed { result_ref: String, usage: Usage },
    Failed { category: String, error: String },
    /// The lease went away mid-run; the result was discarded and the task
    /// store left alone.
    LeaseLost,
}

pub struct Worker {
    id: String,
    layout: Layout,
    leases: Arc<dyn LeaseStore>,
    store: TaskStore,
    log: StatusLog,
    backend: Box<dyn Backend>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: &str,
        layout: Layout,
        leases: Arc<dyn LeaseStore>,
        backend: Box<dyn Backend>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.to_string(),
            store: TaskStore::new(layout.clone()),
            log: StatusLog::new(&layout),
            layout,
            leases,
            backend,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` is requested. Returns the number of tasks handled.
    pub fn run(&self, shutdown: &Shutdown) -> anyhow::Result<usize> {
        self.layout.ensure()?;
        let mut mailbox = MailboxReader::open(&self.layout, &self.id, Arc::clone(&self.leases));
        self.log
            .broadcast(StatusEntry::new(&self.id, "", WorkerState::Skip, "worker ready"));
        tracing::info!(worker_id = %self.id, offset = mailbox.offset(), "worker ready");

        let mut handled = 0;
        while !shutdown.requested() {
            let Some(instruction) = mailbox.poll_timeout(self.settings.poll_interval) else {
                continue;
            };
            self.run_task(&instruction);
            handled += 1;
        }

        for lease in self.leases.live_leases() {
            if lease.holder_id == self.id {
                self.leases.release(&lease.resource_id, &self.id);
            }
        }
        self.log
            .broadcast(StatusEntry::new(&self.id, "", WorkerState::Wait, "worker stopped"));
        tracing::info!(worker_id = %self.id, handled, "worker stopped");
        Ok(handled)
    }

    /// Execute one instruction end to end. The lease is released on every path.
    pub fn run_task(&self, instruction: &Instruction) -> TaskRun {
        let task_id = instruction.task_id.as_str();
        let _span = tracing::info_span!("task", task_id, worker_id = %self.id).entered();

        self.log.broadcast(
            StatusEntry::new(&self.id, task_id, WorkerState::Start, "started")
                .with_meta(json!({ "priority": instruction.payload.priority })),
        );
        tracing::info!("task started");

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.leases),
            task_id,
            &self.id,
            self.settings.heartbeat_interval,
        );
        let started = Instant::now();
        let result = self
            .backend
            .execute(&instruction.payload.prompt, &self.settings.execute);
        let duration_ms = error::millis(started.elapsed());

        let run = if heartbeat.lost() || !self.leases.holds(task_id, &self.id) {
            self.log.broadcast(StatusEntry::new(
                &self.id,
                task_id,
                WorkerState::Skip,
                "lease lost, result discarded",
            ));
            tracing::warn!("lease lost during execution, result discarded");
            TaskRun::LeaseLost
        } else {
            match result {
                Ok(completion) => match self.write_result(task_id, &completion.content) {
                    Ok(result_ref) => {
                        self.record_success(task_id, &result_ref, completion.usage, duration_ms)
                    }
                    Err(e) => self.record_failure(
                        task_id,
                        "io",
                        format!("cannot write result: {e}"),
                        duration_ms,
                    ),
                },
                Err(e) => self.record_failure(task_id, e.category(), e.to_string(), duration_ms),
            }
        };

        if !heartbeat.stop(HEARTBEAT_STOP_TIMEOUT) {
            tracing::warn!("heartbeat thread did not stop in time");
        }
        self.leases.release(task_id, &self.id);
        run
    }

    /// Write the result file and return its path relative to the coordination dir.
    fn write_result(&self, task_id: &str, content: &str) -> std::io::Result<String> {
        let path = self.layout.result_file(task_id);
        layout::atomic_write(&path, content.as_bytes())?;
        let relative = path.strip_prefix(self.layout.root()).unwrap_or(&path);
        Ok(relative.display().to_string())
    }

    /// Record the outcome in the task store. When that fails the status entry
    /// carries the store error, since the store still says ASSIGNED.
    fn finish(&self, task_id: &str, outcome: &Outcome, meta: &mut serde_json::Value) {
        if let Err(e) = self.store.finish(task_id, outcome) {
            tracing::warn!(error = %e, "cannot record outcome in task store");
            meta["store_error"] = json!(e.to_string());
        }
    }

    fn record_success(&self, task_id: &str, result_ref: &str, usage: Usage, duration_ms: u64) -> TaskRun {
        let outcome = Outcome::Completed {
            result_ref: result_ref.to_string(),
        };
        let mut meta = json!({
            "usage": usage,
            "result_ref": result_ref,
            "duration_ms": duration_ms,
        });
        self.finish(task_id, &outcome, &mut meta);
        self.log
            .broadcast(StatusEntry::new(&self.id, task_id, WorkerState::Done, "completed").with_meta(meta));
        tracing::info!(
            result_ref,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            duration_ms,
            "task completed"
        );
        TaskRun::Completed {
            result_ref: result_ref.to_string(),
            usage,
        }
    }

    fn record_failure(&self, task_id: &str, category: &str, error: String, duration_ms: u64) -> TaskRun {
        let outcome = Outcome::Failed {
            error: error.clone(),
        };
        let mut meta = json!({
            "category": category,
            "duration_ms": duration_ms,
        });
        self.finish(task_id, &outcome, &mut meta);
        self.log
            .broadcast(StatusEntry::new(&self.id, task_id, WorkerState::Error, error.clone()).with_meta(meta));
        tracing::warn!(category, error = %error, "task failed");
        TaskRun::Failed {
            category: category.to_string(),
            error,
        }
    }
}
