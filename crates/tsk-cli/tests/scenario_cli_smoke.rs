use std::io::Write;

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn tsk() -> std::process::Command {
    let mut cmd = std::process::Command::cargo_bin("tsk").unwrap();
    cmd.env_remove("TSK_TOKEN").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn config_hash_prints_hash_and_canonical_json() -> anyhow::Result<()> {
    let mut base = tempfile::NamedTempFile::new()?;
    writeln!(base, "api:\n  base_url: \"http://localhost:3001\"\n  request_timeout_ms: 5000")?;
    let mut local = tempfile::NamedTempFile::new()?;
    writeln!(local, "api:\n  request_timeout_ms: 250")?;

    tsk()
        .arg("config-hash")
        .arg(base.path())
        .arg(local.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("config_hash="))
        .stdout(predicate::str::contains("\"request_timeout_ms\":250"));
    Ok(())
}

#[test]
fn config_with_secret_literal_is_refused() -> anyhow::Result<()> {
    let mut f = tempfile::NamedTempFile::new()?;
    writeln!(f, "auth:\n  token_env: \"Bearer abc.def\"")?;

    tsk()
        .arg("config-hash")
        .arg(f.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_SECRET_DETECTED"));
    Ok(())
}

#[test]
fn paper_add_is_confirmed() {
    tsk()
        .args(["--paper", "add", "Buy milk"])
        .assert()
        .success()
        .stdout(predicate::str::contains("create confirmed"))
        .stdout(predicate::str::contains("srv-1"));
}

#[test]
fn paper_list_starts_empty() {
    tsk()
        .args(["--paper", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(no tasks)"));
}

#[test]
fn paper_done_on_unknown_task_fails() {
    tsk()
        .args(["--paper", "done", "srv-404"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("srv-404"));
}

#[test]
fn paper_list_with_layered_config() -> anyhow::Result<()> {
    let mut f = tempfile::NamedTempFile::new()?;
    writeln!(f, "api:\n  request_timeout_ms: 250\nengine:\n  queue_capacity: 8")?;

    tsk()
        .arg("--paper")
        .arg("--config")
        .arg(f.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no tasks)"));
    Ok(())
}
