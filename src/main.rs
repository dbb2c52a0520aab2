// src/main.rs

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Detect {
            session,
            check_updates,
        } => commands::cmd_detect(&session, check_updates),

        Commands::Plan { session, plan } => commands::cmd_plan(&session, &plan),

        Commands::Apply {
            session,
            plan,
            launcher,
            files_in_use_retries,
            no_progress,
        } => commands::cmd_apply(
            &session,
            &plan,
            launcher.as_ref(),
            files_in_use_retries,
            !no_progress,
        ),

        Commands::Eval {
            condition,
            variables,
        } => commands::cmd_eval(&condition, &variables),

        Commands::Format {
            template,
            variables,
        } => commands::cmd_format(&template, &variables),
    }
}
