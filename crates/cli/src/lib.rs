pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tars",
    about = "TARS operator CLI",
    long_about = "Operate the TARS Slack assistant: migrations, config inspection, readiness checks, \
                  conversation checkpoints and the delayed evaluation queue.",
    after_help = "Examples:\n  tars doctor --json\n  tars checkpoints list\n  tars queue list --status dead_letter"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, Slack credentials, DB connectivity and MCP server resolution")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect or clear conversation checkpoints")]
    Checkpoints(CheckpointCommand),
    #[command(subcommand, about = "Inspect or retry delayed evaluations")]
    Queue(QueueCommand),
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    #[command(about = "List threads with live checkpoints")]
    List,
    #[command(about = "Show the checkpoint history of a thread")]
    Show { thread_id: String },
    #[command(about = "Delete every checkpoint of a thread")]
    Clear { thread_id: String },
    #[command(about = "Delete expired checkpoints")]
    Prune,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    #[command(about = "List queued evaluations")]
    List {
        #[arg(long, help = "Filter by status: pending, in_flight or dead_letter")]
        status: Option<String>,
    },
    #[command(about = "Requeue a dead-lettered evaluation")]
    Retry { message_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Checkpoints(command) => match command {
            CheckpointCommand::List => commands::checkpoints::list(),
            CheckpointCommand::Show { thread_id } => commands::checkpoints::show(&thread_id),
            CheckpointCommand::Clear { thread_id } => commands::checkpoints::clear(&thread_id),
            CheckpointCommand::Prune => commands::checkpoints::prune(),
        },
        Command::Queue(command) => match command {
            QueueCommand::List { status } => commands::queue::list(status.as_deref()),
            QueueCommand::Retry { message_id } => commands::queue::retry(&message_id),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
