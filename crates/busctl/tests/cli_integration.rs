//! Integration tests for the busctl CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use busctl::platform::{HMAC_BASE, RNGCTRL_BASE};
use peripherals as _;
use regbank_core as _;
use rstest as _;
use serde as _;
use serde_json as _;
use thiserror as _;
use tracing as _;
use tracing_subscriber as _;

fn create_temp_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn busctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_busctl"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run busctl")
}

fn hmac_script() -> String {
    format!(
        "\
# SHA-256(\"abc\")
write {cmd:#x} 1
write {fifo:#x} 0x61 b
write {fifo:#x} 0x62 b
write {fifo:#x} 0x63 b
write {enable:#x} 1
write {cmd:#x} 2
read  {digest:#x} == 0xba78_16bf
line  hmac.hmac_done == 1
",
        cmd = HMAC_BASE + 0x14,
        fifo = HMAC_BASE + 0x800,
        enable = HMAC_BASE + 0x04,
        digest = HMAC_BASE + 0x44,
    )
}

#[test]
fn passing_script_exits_zero() {
    let temp_dir = tempfile::tempdir().unwrap();
    let script = create_temp_file(temp_dir.path(), "hmac.bus", &hmac_script());

    let output = busctl(&["run", script.to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Summary: 2 passed, 0 failed (8 commands)"), "{stdout}");
}

#[test]
fn failed_expectation_is_reported_with_its_line() {
    let temp_dir = tempfile::tempdir().unwrap();
    let script = create_temp_file(
        temp_dir.path(),
        "depth.bus",
        &format!("read {:#x} == 64\nread {:#x} == 32\n", RNGCTRL_BASE + 0xC, RNGCTRL_BASE + 0xC),
    );

    let output = busctl(&["run", script.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("depth.bus:2: FAIL"), "{stdout}");
    assert!(stdout.contains("got 0x40"), "{stdout}");
    assert!(stdout.contains("1 passed, 1 failed"), "{stdout}");
}

#[test]
fn parse_error_names_the_line() {
    let temp_dir = tempfile::tempdir().unwrap();
    let script = create_temp_file(temp_dir.path(), "bad.bus", "reset\nwrite 0x10\n");

    let output = busctl(&["run", script.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad.bus:2: error: missing value"), "{stderr}");
}

#[test]
fn config_relocates_and_removes_models() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = create_temp_file(
        temp_dir.path(),
        "platform.json",
        r#"{ "hmac": { "base": "0x5000_0000" }, "xrdc": null }"#,
    );

    let output = busctl(&["map", "--config", config.to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0x50000000..=0x50000fff hmac"), "{stdout}");
    assert!(!stdout.contains("xrdc"), "{stdout}");
    assert!(stdout.contains("edn"), "{stdout}");
}

#[test]
fn invalid_config_fails() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = create_temp_file(temp_dir.path(), "platform.json", r#"{ "uart": {} }"#);
    let script = create_temp_file(temp_dir.path(), "empty.bus", "# nothing\n");

    let output = busctl(&[
        "run",
        script.to_str().unwrap(),
        "-c",
        config.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid platform description"), "{stderr}");
}

#[test]
fn verbose_run_logs_bus_traffic() {
    let temp_dir = tempfile::tempdir().unwrap();
    let script = create_temp_file(temp_dir.path(), "hmac.bus", &hmac_script());

    let output = busctl(&["run", script.to_str().unwrap(), "--verbose"]);

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("executing"), "{stderr}");
}

#[test]
fn unmapped_access_warns_but_passes() {
    let temp_dir = tempfile::tempdir().unwrap();
    let script = create_temp_file(temp_dir.path(), "hole.bus", "read 0x10 == 0\n");

    let output = busctl(&["run", script.to_str().unwrap()]);

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("read from unmapped address"), "{stderr}");
}
