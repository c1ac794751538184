use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

fn campus_sync() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("campus-sync"));
    cmd.env_remove("CAMPUS_SYNC_CONFIG")
        .env_remove("CAMPUS_SYNC_DEBUG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1")
        .env("CLICOLOR", "0");
    cmd
}

fn write_config(dir: &Path, actor_id: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    let contents = format!(
        "session:\n  max_inactivity_minutes: 20\n  warn_before_minutes: 2\n  actor_id: {actor_id}\nretry:\n  max_attempts: 4\n"
    );
    fs::write(&path, contents).expect("failed to write config");
    path
}

#[test]
fn status_uses_custom_config_path() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let config_path = write_config(temp.path(), "registrar-9");

    let assert = campus_sync()
        .arg("status")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout);
    assert!(stdout.contains("registrar-9"));
    assert!(stdout.contains("20 min (warning 2 min before)"));
    assert!(stdout.contains("Max attempts:        4"));
    assert!(stdout.contains(&config_path.to_string_lossy().to_string()));

    Ok(())
}

#[test]
fn status_falls_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let missing = temp.path().join("missing.yaml");

    campus_sync()
        .arg("status")
        .arg("--config")
        .arg(&missing)
        .assert()
        .success()
        .stdout(predicate::str::contains("not found, using defaults"))
        .stdout(predicate::str::contains("30 min (warning 5 min before)"));

    Ok(())
}

#[test]
fn status_rejects_invalid_config() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let path = temp.path().join("config.yaml");
    fs::write(
        &path,
        "session:\n  max_inactivity_minutes: 5\n  warn_before_minutes: 10\n",
    )?;

    campus_sync()
        .arg("status")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));

    Ok(())
}

#[test]
fn init_writes_default_config() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let path = temp.path().join("campus").join("config.yaml");

    campus_sync()
        .arg("init")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    let contents = fs::read_to_string(&path)?;
    assert!(contents.contains("max_inactivity_minutes: 30"));
    assert!(contents.contains("max_attempts: 3"));

    // A second run must not clobber the file
    campus_sync()
        .arg("init")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    campus_sync()
        .arg("init")
        .arg("--force")
        .arg("--config")
        .arg(&path)
        .assert()
        .success();

    Ok(())
}

#[test]
fn version_prints_package_version() {
    campus_sync()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn simulate_refresh_failure_forces_logout() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let missing = temp.path().join("none.yaml");

    campus_sync()
        .arg("simulate")
        .arg("--config")
        .arg(&missing)
        .arg("--token-ttl-secs")
        .arg("200")
        .arg("--fail-refresh")
        .assert()
        .success()
        .stdout(predicate::str::contains("Session expired"))
        .stdout(predicate::str::contains("credential refresh failed"))
        .stdout(predicate::str::contains("logout:  1"))
        .stdout(predicate::str::contains("session_refresh_failed"))
        .stdout(predicate::str::contains("Session data cleared: yes"));

    Ok(())
}

#[test]
fn simulate_inactivity_expiry() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let missing = temp.path().join("none.yaml");

    campus_sync()
        .arg("simulate")
        .arg("--config")
        .arg(&missing)
        .arg("--inactivity-secs")
        .arg("4")
        .arg("--warn-secs")
        .arg("2")
        .assert()
        .success()
        .stdout(predicate::str::contains("Loaded 3 students after 2 attempts"))
        .stdout(predicate::str::contains("Inactivity warning"))
        .stdout(predicate::str::contains("expired after inactivity"))
        .stdout(predicate::str::contains("session_expired_inactivity"));

    Ok(())
}
