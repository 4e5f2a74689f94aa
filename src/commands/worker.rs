use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use super::ProjectArgs;
use crate::backend;
use crate::error::ExitError;
use crate::lease::FileLeaseStore;
use crate::shutdown::Shutdown;
use crate::worker::{Worker, WorkerSettings};

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Worker number, 1-based; the worker id is `<prefix>-<id>`
    #[arg(long)]
    pub id: u32,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl WorkerArgs {
    pub fn execute(&self) -> Result<()> {
        if self.id == 0 {
            return Err(ExitError::Config("worker ids start at 1".into()).into());
        }
        let project = self.project.load()?;
        let layout = project.layout();
        layout.ensure()?;

        let backend = backend::from_config(&project.config.backend)?;
        let shutdown = Shutdown::new(layout.clone());
        shutdown.install_signal_handler()?;

        let worker = Worker::new(
            &project.config.worker_id(self.id),
            layout.clone(),
            Arc::new(FileLeaseStore::new(layout)),
            backend,
            WorkerSettings::from_config(&project.config),
        );
        worker.run(&shutdown)?;
        Ok(())
    }
}
