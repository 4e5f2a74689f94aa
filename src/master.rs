//! Master loop: dispatch on one clock, summarize on another.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error;
use crate::layout::Layout;
use crate::lease::LeaseStore;
use crate::mailbox::Mailboxes;
use crate::shutdown::Shutdown;
use crate::status_log::{StatusEntry, StatusLog, WorkerState};
use crate::summary::{MASTER_ID, SystemSummary};
use crate::task_store::TaskRepository;

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub poll_interval: Duration,
    pub summary_interval: Duration,
    pub lease_ttl_secs: u64,
    pub worker_ids: Vec<String>,
}

impl MasterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            summary_interval: config.summary_interval(),
            lease_ttl_secs: config.coordination.lease_ttl_secs,
            worker_ids: config.worker_ids(),
        }
    }
}

/// Totals over the master's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterStats {
    pub cycles: usize,
    pub assigned: usize,
    pub rolled_back: usize,
}

impl MasterStats {
    fn record(&mut self, report: &DispatchReport) {
        self.cycles += 1;
        self.assigned += report.assigned.len();
        self.rolled_back += report.rolled_back.len();
    }
}

pub struct Master {
    layout: Layout,
    leases: Arc<dyn LeaseStore>,
    dispatcher: Dispatcher,
    log: StatusLog,
    settings: MasterSettings,
}

impl Master {
    pub fn new(
        layout: Layout,
        leases: Arc<dyn LeaseStore>,
        tasks: Arc<dyn TaskRepository>,
        settings: MasterSettings,
    ) -> Self {
        let log = StatusLog::new(&layout);
        let dispatcher = Dispatcher::new(
            Arc::clone(&leases),
            tasks,
            log.clone(),
            Mailboxes::new(layout.clone()),
            settings.worker_ids.clone(),
            settings.lease_ttl_secs,
        );
        Self {
            layout,
            leases,
            dispatcher,
            log,
            settings,
        }
    }

    /// Run until `shutdown` is requested, then append the final DONE entry.
    pub fn run(&self, shutdown: &Shutdown) -> anyhow::Result<MasterStats> {
        self.layout.ensure()?;
        tracing::info!(
            workers = self.settings.worker_ids.len(),
            poll_ms = error::millis(self.settings.poll_interval),
            "master started"
        );

        let mut stats = MasterStats::default();
        let mut next_dispatch = Instant::now();
        let mut next_summary = Instant::now() + self.settings.summary_interval;

        while !shutdown.requested() {
            let now = Instant::now();
            if now >= next_dispatch {
                self.dispatch_once(&mut stats);
                next_dispatch = now + self.settings.poll_interval;
            }
            if now >= next_summary {
                self.summarize();
                next_summary = now + self.settings.summary_interval;
            }
            let wake = next_dispatch.min(next_summary);
            thread::sleep(wake.saturating_duration_since(Instant::now()));
        }

        self.log.broadcast(
            StatusEntry::new(MASTER_ID, "", WorkerState::Done, "master stopped").with_meta(json!({
                "cycles": stats.cycles,
                "assigned": stats.assigned,
                "rolled_back": stats.rolled_back,
            })),
        );
        tracing::info!(cycles = stats.cycles, assigned = stats.assigned, "master stopped");
        Ok(stats)
    }

    fn dispatch_once(&self, stats: &mut MasterStats) {
        match self.dispatcher.run_cycle() {
            Ok(report) => {
                if !report.contended.is_empty() {
                    tracing::debug!(tasks = ?report.contended, "contended tasks skipped");
                }
                stats.record(&report);
            }
            Err(e) => tracing::warn!(error = %e, "dispatch skipped, task store unreadable"),
        }
    }

    fn summarize(&self) {
        match SystemSummary::collect(
            &self.layout,
            self.leases.as_ref(),
            &self.settings.worker_ids,
            Utc::now(),
        ) {
            Ok(summary) => summary.log(),
            Err(e) => tracing::warn!(error = %e, "summary skipped, task store unreadable"),
        }
    }
}
