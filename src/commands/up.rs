use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use super::ProjectArgs;
use crate::error::ExitError;
use crate::shutdown::Shutdown;

const REAP_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Args)]
pub struct UpArgs {
    /// Number of workers (default: workers.count)
    #[arg(long)]
    pub workers: Option<u32>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

struct Proc {
    name: String,
    child: Child,
    exit: Option<i32>,
}

impl UpArgs {
    /// Run one master and N workers as child processes of this one.
    ///
    /// Children share the coordination directory and nothing else. Stopping
    /// (Ctrl-C or `hive down`) goes through the stop file, so each child
    /// finishes its current iteration.
    pub fn execute(&self) -> Result<()> {
        let project = self.project.load()?;
        let layout = project.layout();
        layout.ensure()?;
        if layout.stop_requested() {
            std::fs::remove_file(layout.stop_file()).context("clearing previous stop request")?;
        }

        let count = self.workers.unwrap_or(project.config.workers.count);
        if count == 0 {
            return Err(ExitError::Config("need at least one worker".into()).into());
        }

        let exe = std::env::current_exe().context("locating hive executable")?;
        let spawn = |name: String, args: Vec<String>| -> Result<Proc> {
            let child = Command::new(&exe)
                .args(&args)
                .arg("--project-root")
                .arg(&project.root)
                .env(crate::config::ENV_WORKERS, count.to_string())
                .stdin(Stdio::null())
                .spawn()
                .with_context(|| format!("spawning {name}"))?;
            tracing::info!(process = %name, pid = child.id(), "started");
            Ok(Proc {
                name,
                child,
                exit: None,
            })
        };

        let mut procs = vec![spawn("master".into(), vec!["master".into()])?];
        for n in 1..=count {
            procs.push(spawn(
                project.config.worker_id(n),
                vec!["worker".into(), "--id".into(), n.to_string()],
            )?);
        }

        let shutdown = Shutdown::new(layout.clone());
        shutdown.install_signal_handler()?;
        let mut stop_written = false;

        while procs.iter().any(|p| p.exit.is_none()) {
            if shutdown.requested() && !stop_written {
                std::fs::write(layout.stop_file(), chrono::Utc::now().to_rfc3339())
                    .context("writing stop file")?;
                stop_written = true;
            }
            for proc in procs.iter_mut().filter(|p| p.exit.is_none()) {
                if let Some(status) = proc.child.try_wait()? {
                    let code = status.code().unwrap_or(-1);
                    tracing::info!(process = %proc.name, code, "exited");
                    proc.exit = Some(code);
                }
            }
            thread::sleep(REAP_INTERVAL);
        }

        let failed: Vec<String> = procs
            .iter()
            .filter(|p| p.exit != Some(0))
            .map(|p| format!("{} (exit {})", p.name, p.exit.unwrap_or(-1)))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ExitError::Other(format!("processes failed: {}", failed.join(", "))).into())
        }
    }
}
