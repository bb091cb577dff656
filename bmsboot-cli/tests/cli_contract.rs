//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("bmsboot");
    cmd.env_remove("BMSBOOT_PORT")
        .env_remove("BMSBOOT_BAUD")
        .env_remove("BMSBOOT_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bmsboot"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bmsboot"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_bash_writes_script() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_bmsboot()"));
}

#[test]
fn unknown_command_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.arg("frobnicate").assert().code(2);
}

#[test]
fn write_missing_firmware_fails() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.bin");

    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "-p", "/dev/bmsboot-test", "write"])
        .arg(&missing)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn write_oversized_firmware_fails_before_opening_port() {
    let dir = tempdir().unwrap();
    let firmware = dir.path().join("big.bin");
    fs::write(&firmware, vec![0xFF; 0x1_0000]).unwrap();

    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "-p", "/dev/bmsboot-test", "write"])
        .arg(&firmware)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("too big"));
}

#[test]
fn write_empty_firmware_fails() {
    let dir = tempdir().unwrap();
    let firmware = dir.path().join("empty.bin");
    fs::write(&firmware, []).unwrap();

    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "-p", "/dev/bmsboot-test", "write"])
        .arg(&firmware)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn write_invalid_page_size_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["write", "fw.bin", "--page-size", "512"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("page size"));
}

#[test]
fn read_requires_length() {
    let mut cmd = cli_cmd();
    cmd.args(["read", "out.bin"]).assert().code(2);
}

#[test]
fn non_interactive_erase_requires_yes() {
    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "erase"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("bmsboot.toml");
    fs::write(&config, "[port\nname = ").unwrap();

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("TOML"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    assert!(output.stderr.is_empty());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert!(value.is_array());
}
