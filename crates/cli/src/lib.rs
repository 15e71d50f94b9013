pub mod commands;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Operate the Expensa approval router: migrations, demo data, config inspection, readiness checks, and routing dry runs.",
    after_help = "Examples:\n  expensa doctor --json\n  expensa config\n  expensa route --company co-acme --amount 1500 --category travel"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo tenant (company, users, approval rules)")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, currency table, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Show which rule and approver chain an expense would get, without storing it"
    )]
    Route {
        #[arg(long, help = "Company id to route within")]
        company: String,
        #[arg(long, help = "Expense amount in the submitted currency")]
        amount: Decimal,
        #[arg(long, help = "Expense category")]
        category: String,
        #[arg(long, help = "Submitted currency (defaults to the company base currency)")]
        currency: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Route { company, amount, category, currency } => {
            commands::route::run(commands::route::RouteArgs {
                company,
                amount,
                category,
                currency,
            })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
