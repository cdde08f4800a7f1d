//! CLI module for TimeLedger
//!
//! Provides commands:
//! - `serve`: run the background jobs until a shutdown signal
//! - `expand`: print a center's or teacher's sessions
//! - `jobs`: list or run the background jobs once
//! - `register`: bind an external identity to a teacher
//! - `config`: print the effective configuration
//! - `doctor`: check configuration and storage

use crate::server::config::AppConfig;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

pub mod doctor;
pub mod expand;
pub mod jobs;
pub mod register;

/// TimeLedger schedule engine CLI
#[derive(Parser, Debug)]
#[command(name = "timeledger")]
#[command(about = "Recurring schedule engine for teaching centers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the background jobs and wait for a shutdown signal
    Serve,
    /// Print expanded sessions over a date range
    Expand {
        /// Center id
        #[arg(long)]
        center: i64,
        /// First date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        from: NaiveDate,
        /// Last date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        to: NaiveDate,
        /// Only this teacher's sessions
        #[arg(long)]
        teacher: Option<i64>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Background jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Register (or look up) the teacher bound to an identity handle
    Register {
        /// External identity handle
        #[arg(long)]
        handle: String,
        /// Display name used when the teacher is created
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Check configuration and storage
    Doctor,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List registered jobs and their triggers
    List,
    /// Run one job now and print its summary
    Run {
        /// Job name (expire_exceptions, reminder_sweep, cleanup_reads)
        name: String,
    },
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("invalid date {:?}: {}", raw, e))
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Serve) => crate::server::run(config).await,
        Some(Commands::Expand {
            center,
            from,
            to,
            teacher,
            json,
        }) => expand::run(config, center, from, to, teacher, json).await,
        Some(Commands::Jobs { command }) => jobs::run(config, command).await,
        Some(Commands::Register {
            handle,
            name,
            email,
        }) => register::run(config, &handle, name, email).await,
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Some(Commands::Doctor) => doctor::run(config).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_parse_expand() {
        let cli = Cli::try_parse_from([
            "timeledger",
            "expand",
            "--center",
            "1",
            "--from",
            "2026-01-05",
            "--to",
            "2026-01-26",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Expand { center, from, teacher, json, .. }) => {
                assert_eq!(center, 1);
                assert_eq!(from, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
                assert!(teacher.is_none());
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_date() {
        assert!(Cli::try_parse_from([
            "timeledger", "expand", "--center", "1", "--from", "05/01/2026", "--to", "2026-01-26",
        ])
        .is_err());
    }
}
