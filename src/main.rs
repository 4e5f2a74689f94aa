use std::process::ExitCode;

use clap::{Parser, Subcommand};

use hive::commands::add::AddArgs;
use hive::commands::down::DownArgs;
use hive::commands::init::InitArgs;
use hive::commands::master::MasterArgs;
use hive::commands::status::StatusArgs;
use hive::commands::up::UpArgs;
use hive::commands::worker::WorkerArgs;
use hive::{commands, error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "hive",
    version,
    about = "Filesystem-coordinated master/worker runner for LLM tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the coordination directory and a default .hive.toml
    Init(InitArgs),
    /// Queue a task
    Add(AddArgs),
    /// Start the master and all workers as child processes
    Up(UpArgs),
    /// Run the dispatch loop
    Master(MasterArgs),
    /// Run one worker loop
    Worker(WorkerArgs),
    /// Show tasks, workers and stale assignments
    Status(StatusArgs),
    /// Ask every running master and worker to stop
    Down(DownArgs),
    /// Print the JSON Schema for .hive.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Add(_) => "add",
            Self::Up(_) => "up",
            Self::Master(_) => "master",
            Self::Worker(_) => "worker",
            Self::Status(_) => "status",
            Self::Down(_) => "down",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Init(args) => args.execute(),
        Commands::Add(args) => args.execute(),
        Commands::Up(args) => args.execute(),
        Commands::Master(args) => args.execute(),
        Commands::Worker(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Down(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
