//! Init command implementation

use colored::Colorize;

use crate::cli::args::GlobalOptions;
use crate::config::Config;
use crate::error::{ConfigError, Result};

/// Write a default config file, refusing to replace one unless forced
pub fn run(opts: &GlobalOptions, force: bool) -> Result<()> {
    let path = Config::resolve_path(opts.config_ref())?;

    if path.exists() && !force {
        return Err(ConfigError::Invalid(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }

    Config::default().save_to(&path)?;

    println!("{}", "✓ Configuration written".green());
    println!("  {}", path.display().to_string().cyan());
    println!("\nEdit the file to tune session timeouts, caching and retries.");
    Ok(())
}
