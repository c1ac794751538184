//! Global CLI options shared across all commands

use crate::cli::Cli;

/// Global CLI options passed to all command handlers.
///
/// Precedence is: CLI flag > environment variable > config file > default.
/// This struct captures the CLI/env layer.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Custom config file path (defaults to ~/.campus-sync/config.yaml)
    pub config: Option<String>,

    pub debug: bool,
}

impl GlobalOptions {
    /// Called once in main.rs after parsing.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            debug: cli.debug,
        }
    }

    /// Get config path as `Option<&str>`.
    pub fn config_ref(&self) -> Option<&str> {
        self.config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from(["campus-sync", "--config", "/tmp/test.yaml", "status"]);
        let opts = GlobalOptions::from_cli(&cli);

        assert_eq!(opts.config_ref(), Some("/tmp/test.yaml"));
        assert!(!opts.debug);
    }

    #[test]
    fn test_default_has_no_override() {
        assert!(GlobalOptions::default().config_ref().is_none());
    }
}
