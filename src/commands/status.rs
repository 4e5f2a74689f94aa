use std::io::IsTerminal;

use chrono::Utc;
use clap::Args;

use super::ProjectArgs;
use crate::lease::FileLeaseStore;
use crate::status_log::WorkerState;
use crate::summary::SystemSummary;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = self.format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        });

        let project = self.project.load()?;
        let layout = project.layout();
        let leases = FileLeaseStore::new(layout.clone());
        let report = SystemSummary::collect(&layout, &leases, &project.config.worker_ids(), Utc::now())?;

        match format {
            OutputFormat::Pretty => print_pretty(&report, layout.stop_requested()),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

fn print_pretty(report: &SystemSummary, stopping: bool) {
    println!("=== hive status ===\n");
    if stopping {
        println!("(stop requested)\n");
    }

    let t = &report.tasks;
    println!(
        "Tasks: {}  (pending {}, assigned {}, completed {}, failed {})",
        t.total, t.pending, t.assigned, t.completed, t.failed
    );

    println!("\nWorkers:");
    for w in &report.workers {
        let state = w.state.map_or("-", WorkerState::as_str);
        let age = w.age_secs.map(|a| format!("{a}s ago")).unwrap_or_default();
        let task = if w.task_id.is_empty() { "-" } else { w.task_id.as_str() };
        print!("  {:<12} {:<9} {:<16} {}", w.worker_id, state, task, age);
        if w.error_streak > 0 {
            print!("  errors x{}", w.error_streak);
        }
        println!();
    }

    if !report.stale_assignments.is_empty() {
        println!("\nStale assignments (no live lease):");
        for s in &report.stale_assignments {
            println!("  • {} → {}", s.task_id, s.worker_id.as_deref().unwrap_or("?"));
        }
    }
}

fn print_text(report: &SystemSummary) {
    let t = &report.tasks;
    println!("hive-status");
    println!(
        "tasks  total={}  pending={}  assigned={}  completed={}  failed={}",
        t.total, t.pending, t.assigned, t.completed, t.failed
    );
    for w in &report.workers {
        println!(
            "worker  id={}  state={}  task={}  idle={}  errors={}  lease={}",
            w.worker_id,
            w.state.map_or("-", WorkerState::as_str),
            if w.task_id.is_empty() { "-" } else { w.task_id.as_str() },
            w.idle,
            w.error_streak,
            w.lease.as_deref().unwrap_or("-"),
        );
    }
    for s in &report.stale_assignments {
        println!(
            "stale  task={}  worker={}",
            s.task_id,
            s.worker_id.as_deref().unwrap_or("-")
        );
    }
}
