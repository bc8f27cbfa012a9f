use std::process::ExitCode;

use clap::{Parser, Subcommand};

use thread_worker::commands;
use thread_worker::commands::run::RunArgs;
use thread_worker::error;
use thread_worker::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "thread-worker",
    version,
    about = "Per-thread job consumer for agent sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consume job envelopes (one JSON object per line) from stdin
    Run(RunArgs),
    /// Normalize one job envelope from stdin and print its payload
    Extract,
    /// Print the queue name for a deployment
    QueueName {
        /// Deployment identifier
        deployment: String,
    },
    /// Print the JSON Schema for .thread-worker.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Extract => "extract",
            Self::QueueName { .. } => "queue-name",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Extract => commands::extract::run_extract(),
        Commands::QueueName { deployment } => commands::run_queue_name(&deployment),
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
