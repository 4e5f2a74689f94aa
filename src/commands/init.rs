use std::fs;

use anyhow::{Context, Result};
use clap::Args;

use super::ProjectArgs;
use crate::config::{self, CONFIG_TOML, Config};
use crate::task_store::TaskStore;

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Overwrite an existing .hive.toml with defaults
    #[arg(long)]
    pub force: bool,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let project = self.project.load()?;
        let config_path = project.root.join(CONFIG_TOML);

        if config::find_config(&project.root).is_some() && !self.force {
            println!("{} already exists (use --force to overwrite)", config_path.display());
        } else {
            let body = Config::default().to_toml()?;
            fs::write(&config_path, body)
                .with_context(|| format!("writing {}", config_path.display()))?;
            println!("wrote {}", config_path.display());
        }

        let layout = project.layout();
        layout.ensure()?;
        TaskStore::new(layout.clone())
            .ensure_exists()
            .with_context(|| format!("creating task store in {}", layout.root().display()))?;
        tracing::info!(dir = %layout.root().display(), "coordination directory ready");
        println!("coordination directory: {}", layout.root().display());
        Ok(())
    }
}
