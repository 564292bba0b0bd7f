mod commands;

use crate::backup::RunOutcome;
use crate::error::BackupError;
use crate::log::LogFormat;
use crate::shutdown::Shutdown;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Scheduled PostgreSQL backups to local disk or S3",
    long_about = None
)]
pub struct Cli {
    /// Config file (default: ~/.pg_backup_agent/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(about = "Run one backup cycle and exit")]
    Run,
    #[command(about = "Run backups on the configured schedule until interrupted")]
    Daemon,
    #[command(about = "List stored artifacts, oldest first", alias = "ls")]
    List,
    #[command(about = "Apply the retention policy without taking a backup")]
    Prune {
        /// Only print what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    #[command(about = "Validate the configuration and locate pg_dump")]
    Check,
    #[command(about = "Write a default configuration file")]
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Exit status for an error that ended a command before or outside a cycle.
pub fn exit_code(err: &BackupError) -> i32 {
    RunOutcome::Failed(err.failure_kind()).exit_code()
}

/// Runs the selected command and returns the process exit status.
pub async fn execute(cli: Cli, shutdown: Shutdown) -> i32 {
    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Command::Run => commands::run(config_path, &shutdown).await,
        Command::Daemon => commands::daemon(config_path, &shutdown).await,
        Command::List => commands::list(config_path).await,
        Command::Prune { dry_run } => commands::prune(config_path, dry_run).await,
        Command::Check => commands::check(config_path).await,
        Command::Init { force } => commands::init(config_path, force),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", style("Error").red(), e);
            exit_code(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DumpError, StoreError};

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["pg-backup-agent", "prune", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Command::Prune { dry_run: true }));
        assert_eq!(cli.log_format, LogFormat::Text);

        let cli = Cli::try_parse_from([
            "pg-backup-agent",
            "run",
            "--config",
            "/etc/pg-backup/config.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/pg-backup/config.toml")));
        assert_eq!(cli.log_format, LogFormat::Json);

        assert!(Cli::try_parse_from(["pg-backup-agent"]).is_err());
        assert!(Cli::try_parse_from(["pg-backup-agent", "restore"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&BackupError::Config("bad".into())), 2);
        assert_eq!(exit_code(&DumpError::EmptyOutput.into()), 3);
        assert_eq!(exit_code(&StoreError::Rejected("no".into()).into()), 4);
        assert_eq!(exit_code(&DumpError::Cancelled.into()), 130);
    }
}
