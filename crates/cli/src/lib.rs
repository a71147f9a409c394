pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "closeflow",
    about = "Closeflow operator CLI",
    long_about = "Operate the post-sale flow orchestrator: migrations, demo data, due-flow scans, config inspection, and readiness checks.",
    after_help = "Examples:\n  closeflow doctor --json\n  closeflow process-pending --tenant tenant-demo\n  closeflow config"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo flows; re-running is a no-op")]
    Seed,
    #[command(about = "Run one due-flow scan batch and report the outcome counts")]
    ProcessPending {
        #[arg(long, help = "Restrict the scan to one tenant")]
        tenant: Option<String>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, and migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::ProcessPending { tenant } => commands::process_pending::run(tenant.as_deref()),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
