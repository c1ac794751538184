//! Simulate command implementation
//!
//! Signs in against the in-memory backend, loads a roster through the sync
//! layer and then stays idle, printing lifecycle transitions until the
//! session expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::KeyInputs;
use crate::cli::SimulateArgs;
use crate::cli::args::GlobalOptions;
use crate::client::{Credentials, InMemoryBackend};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::{ConfigError, Error, LoadError, Result};
use crate::session::{LifecycleSnapshot, SessionShell, SessionState, ShellSettings};
use crate::sync::{DataSource, SyncContext};

const DEMO_EMAIL: &str = "registrar@school.test";
const DEMO_PASSWORD: &str = "demo";
const DEMO_SCHOOL: &str = "north-campus";
const FETCH_LATENCY: Duration = Duration::from_millis(400);
/// Thirty days
const MAX_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

pub async fn run(opts: &GlobalOptions, args: &SimulateArgs) -> Result<()> {
    let config = Config::load_at(opts.config_ref())?;
    let settings = simulation_settings(&config, args)?;
    let ttl = token_ttl(args.token_ttl_secs)?;
    let clock = SystemClock::shared();

    let mut backend = InMemoryBackend::new()
        .with_account(DEMO_EMAIL, DEMO_PASSWORD)
        .with_token_ttl(ttl)
        .with_clock(Arc::clone(&clock));
    if args.fail_refresh {
        backend = backend.with_failing_refresh();
    }
    let backend = Arc::new(backend);

    println!("{}", "Simulated session".bold());
    println!(
        "  inactivity logout after {}s, warning {}s before, token lifetime {}s{}\n",
        settings.lifecycle.max_inactivity.as_secs(),
        settings.lifecycle.warn_before.as_secs(),
        args.token_ttl_secs,
        if args.fail_refresh {
            ", refresh failing".yellow().to_string()
        } else {
            String::new()
        }
    );

    let shell = SessionShell::new(backend.clone(), backend.clone(), clock, settings);
    let context = shell
        .login(&Credentials::new(DEMO_EMAIL, DEMO_PASSWORD))
        .await?;
    println!("{} Signed in as {}", "✓".green(), DEMO_EMAIL);

    let lifecycle = shell
        .lifecycle()
        .ok_or_else(|| Error::Other("session did not start".to_string()))?;
    let mut snapshots = lifecycle.subscribe();

    load_roster(&context).await?;

    let mut last_state = None;
    loop {
        let snapshot = *snapshots.borrow_and_update();
        report(snapshot, &mut last_state);
        if snapshot.state == SessionState::Expired {
            break;
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }

    if let Some(reason) = lifecycle.expiry_reason() {
        println!("  reason: {}", reason);
    }
    // Audit writes are fire-and-forget; give them a moment to land
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("\n{}", "Backend calls".bold());
    println!("  refresh: {}", backend.refresh_calls());
    println!("  logout:  {}", backend.logout_calls());
    println!("\n{}", "Audit trail".bold());
    for event in backend.audit_events() {
        println!(
            "  {} {}",
            format!("[{:?}]", event.level).dimmed(),
            event.action.as_str()
        );
    }
    println!(
        "\nSession data cleared: {}",
        if context.is_active() {
            "no".red()
        } else {
            "yes".green()
        }
    );
    Ok(())
}

/// Config settings with the command-line overrides applied
fn simulation_settings(config: &Config, args: &SimulateArgs) -> Result<ShellSettings> {
    let mut settings = config.shell_settings();
    if let Some(secs) = args.inactivity_secs {
        settings.lifecycle.max_inactivity = Duration::from_secs(secs);
    }
    if let Some(secs) = args.warn_secs {
        settings.lifecycle.warn_before = Duration::from_secs(secs);
    }
    if args.inactivity_secs.is_some() || args.warn_secs.is_some() {
        settings.lifecycle.poll_interval =
            settings.lifecycle.poll_interval.min(Duration::from_secs(1));
    }

    let lifecycle = &settings.lifecycle;
    if lifecycle.max_inactivity.is_zero() || lifecycle.warn_before >= lifecycle.max_inactivity {
        return Err(ConfigError::Invalid(
            "warning period must be shorter than the inactivity timeout".to_string(),
        )
        .into());
    }
    Ok(settings)
}

fn token_ttl(secs: i64) -> Result<chrono::Duration> {
    if !(1..=MAX_TOKEN_TTL_SECS).contains(&secs) {
        return Err(ConfigError::Invalid(format!(
            "token lifetime must be between 1 and {} seconds",
            MAX_TOKEN_TTL_SECS
        ))
        .into());
    }
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| ConfigError::Invalid("token lifetime out of range".to_string()).into())
}

fn roster_source(context: &SyncContext, attempts: Arc<AtomicUsize>) -> DataSource<Vec<String>> {
    context.data_source("students", move |inputs: KeyInputs| {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            tokio::time::sleep(FETCH_LATENCY).await;
            if attempt == 1 {
                return Err(LoadError::Transient("backend timed out".to_string()));
            }
            let school = inputs.scope().unwrap_or("unknown").to_string();
            Ok((1..=3).map(|n| format!("{} student {}", school, n)).collect())
        }
    })
}

/// Load the demo roster with a progress bar, then show a cache hit
async fn load_roster(context: &SyncContext) -> Result<()> {
    let attempts = Arc::new(AtomicUsize::new(0));
    let roster = Arc::new(roster_source(context, Arc::clone(&attempts)));

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg:<14} [{bar:30}] {pos:>3}%")
            .map_err(|e| Error::Other(e.to_string()))?,
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    let loading = {
        let roster = Arc::clone(&roster);
        tokio::spawn(async move {
            roster.set_inputs(KeyInputs::scoped(DEMO_SCHOOL)).await;
        })
    };
    while !loading.is_finished() {
        let state = roster.state();
        bar.set_position(u64::from(state.progress));
        bar.set_message(state.stage);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    loading
        .await
        .map_err(|e| Error::Other(format!("roster load panicked: {}", e)))?;

    let state = roster.state();
    bar.set_position(u64::from(state.progress));
    bar.finish_with_message(state.stage.clone());

    match (roster.data(), state.error) {
        (Some(students), _) => {
            println!(
                "{} Loaded {} students after {} attempts",
                "✓".green(),
                students.len(),
                attempts.load(Ordering::SeqCst)
            );

            let mirror = roster_source(context, Arc::clone(&attempts));
            let before = attempts.load(Ordering::SeqCst);
            mirror.set_inputs(KeyInputs::scoped(DEMO_SCHOOL)).await;
            if attempts.load(Ordering::SeqCst) == before {
                println!("{} Second consumer served from cache", "✓".green());
            }
        }
        (None, Some(err)) => println!("{} Roster load failed: {}", "✗".red(), err),
        (None, None) => println!("{} Roster load cancelled", "○".dimmed()),
    }
    println!();
    Ok(())
}

fn report(snapshot: LifecycleSnapshot, last_state: &mut Option<SessionState>) {
    let changed = *last_state != Some(snapshot.state);
    *last_state = Some(snapshot.state);
    match snapshot.state {
        SessionState::Active if changed => {
            println!(
                "{} Session active ({}s until inactivity logout)",
                "●".green(),
                snapshot.remaining_seconds
            );
        }
        SessionState::Warning => {
            if changed {
                println!("{} Inactivity warning", "⚠".yellow());
            }
            println!("  logging out in {}s", snapshot.remaining_seconds);
        }
        SessionState::Expired => println!("{} Session expired", "✗".red()),
        _ => {}
    }
}
