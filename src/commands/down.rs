use anyhow::{Context, Result};
use clap::Args;

use super::ProjectArgs;

#[derive(Debug, Args)]
pub struct DownArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl DownArgs {
    /// Ask every master and worker on this directory to stop after their
    /// current iteration.
    pub fn execute(&self) -> Result<()> {
        let layout = self.project.load()?.layout();
        layout.ensure()?;
        let stop = layout.stop_file();
        std::fs::write(&stop, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("writing {}", stop.display()))?;
        println!("stop requested ({})", stop.display());
        Ok(())
    }
}
