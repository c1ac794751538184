//! CLI command definitions and handlers

use clap::{Args, Parser, Subcommand};

pub mod args;
pub mod init;
pub mod simulate;
pub mod status;

pub use args::GlobalOptions;

/// campus-sync - data sync and session lifecycle engine for the school client
#[derive(Parser, Debug)]
#[command(name = "campus-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Override config file location
    #[arg(long, global = true, env = "CAMPUS_SYNC_CONFIG", hide_env = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true, env = "CAMPUS_SYNC_DEBUG", hide_env = true)]
    pub debug: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and effective session settings
    Status,

    /// Run a session against an in-memory backend until it expires
    Simulate(SimulateArgs),

    /// Display version information
    Version,
}

/// Overrides for the simulated session
#[derive(Debug, Clone, Args, Default)]
pub struct SimulateArgs {
    /// Seconds of inactivity before forced logout
    #[arg(long)]
    pub inactivity_secs: Option<u64>,

    /// Seconds before expiry at which the warning starts
    #[arg(long)]
    pub warn_secs: Option<u64>,

    /// Lifetime of tokens issued by the backend
    #[arg(long, default_value_t = 3600)]
    pub token_ttl_secs: i64,

    /// Make every credential refresh fail
    #[arg(long)]
    pub fail_refresh: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate_overrides() {
        let cli = Cli::parse_from([
            "campus-sync",
            "simulate",
            "--inactivity-secs",
            "6",
            "--warn-secs",
            "3",
            "--fail-refresh",
        ]);
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.inactivity_secs, Some(6));
                assert_eq!(args.warn_secs, Some(3));
                assert_eq!(args.token_ttl_secs, 3600);
                assert!(args.fail_refresh);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["campus-sync", "status", "--config", "/tmp/c.yaml", "--debug"]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/c.yaml"));
        assert!(cli.debug);
    }
}
