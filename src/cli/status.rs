//! Status command implementation

use colored::Colorize;

use crate::cli::args::GlobalOptions;
use crate::config::Config;
use crate::error::Result;

/// Show which config file is in effect and the settings derived from it
pub fn run(opts: &GlobalOptions) -> Result<()> {
    println!("{}\n", "campus-sync Configuration Status".bold());

    let path = Config::resolve_path(opts.config_ref())?;
    if path.exists() {
        println!("Config file: {}", path.display().to_string().cyan());
    } else {
        println!(
            "Config file: {} {}",
            path.display().to_string().cyan(),
            "(not found, using defaults)".dimmed()
        );
        println!("  → Run 'campus-sync init' to create it");
    }

    let config = Config::load_at(opts.config_ref())?;
    let session = &config.session;
    let cache = &config.cache;
    let retry = &config.retry;

    println!("\n{}", "Session".bold());
    println!("  Actor:               {}", session.actor_id);
    println!(
        "  Inactivity logout:   {} min (warning {} min before)",
        session.max_inactivity_minutes, session.warn_before_minutes
    );
    println!("  Poll interval:       {} ms", session.poll_interval_ms);
    println!(
        "  Token refresh:       when less than {} s remain",
        session.refresh_threshold_secs
    );

    println!("\n{}", "Cache".bold());
    println!("  TTL:                 {} s", cache.ttl_secs);
    println!("  Retention ceiling:   {} s", cache.retention_secs);
    println!("  Sweep interval:      {} s", cache.sweep_interval_secs);
    println!("  Max entries:         {}", cache.max_entries);

    println!("\n{}", "Retry".bold());
    println!("  Max attempts:        {}", retry.max_attempts);
    println!(
        "  Backoff:             {} ms × attempt (linear)",
        retry.base_delay_ms
    );

    println!("\n{} Configuration valid", "✓".green());
    Ok(())
}
