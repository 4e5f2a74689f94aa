use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use super::ProjectArgs;
use crate::lease::FileLeaseStore;
use crate::master::{Master, MasterSettings};
use crate::shutdown::Shutdown;
use crate::task_store::TaskStore;

#[derive(Debug, Args)]
pub struct MasterArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl MasterArgs {
    pub fn execute(&self) -> Result<()> {
        let project = self.project.load()?;
        let layout = project.layout();
        layout.ensure()?;

        let shutdown = Shutdown::new(layout.clone());
        shutdown.install_signal_handler()?;

        let master = Master::new(
            layout.clone(),
            Arc::new(FileLeaseStore::new(layout.clone())),
            Arc::new(TaskStore::new(layout)),
            MasterSettings::from_config(&project.config),
        );
        master.run(&shutdown)?;
        Ok(())
    }
}
