use std::io::Read;

use anyhow::{Context, Result};
use clap::Args;

use super::ProjectArgs;
use crate::task_store::{DEFAULT_PRIORITY, TaskStore};

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Task prompt ("-" reads it from stdin)
    pub prompt: String,
    /// Priority, 1 (most urgent) to 5
    #[arg(long, short, default_value_t = DEFAULT_PRIORITY)]
    pub priority: u8,
    /// Explicit task id (default: task-N)
    #[arg(long)]
    pub id: Option<String>,
    #[command(flatten)]
    pub project: ProjectArgs,
}

impl AddArgs {
    pub fn execute(&self) -> Result<()> {
        let project = self.project.load()?;
        let layout = project.layout();
        layout.ensure()?;

        let prompt = if self.prompt == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf
        } else {
            self.prompt.clone()
        };
        if prompt.trim().is_empty() {
            anyhow::bail!("prompt is empty");
        }

        let task = TaskStore::new(layout).add(self.id.as_deref(), &prompt, self.priority)?;
        tracing::info!(task_id = %task.id, priority = task.priority, "task added");
        println!("{}", task.id);
        Ok(())
    }
}
