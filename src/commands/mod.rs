pub mod add;
pub mod down;
pub mod init;
pub mod master;
pub mod schema;
pub mod status;
pub mod up;
pub mod worker;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Args;

use crate::config::Config;
use crate::layout::Layout;

/// Project location shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    /// Project root directory (holds .hive.toml)
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,
}

/// Resolved project root and effective config.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl ProjectArgs {
    /// Load `.hive.toml` and apply environment overrides.
    ///
    /// This is the only place the process environment feeds into config.
    pub fn load(&self) -> anyhow::Result<Project> {
        let root = match &self.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("resolving current directory")?,
        };
        let mut config = Config::discover(&root)?;
        config.apply_env(std::env::vars())?;
        Ok(Project { root, config })
    }
}

impl Project {
    pub fn layout(&self) -> Layout {
        Layout::new(&self.config.coordination.dir)
    }
}
