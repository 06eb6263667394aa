//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::PathBuf, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ergota");
    for var in [
        "ERGOTA_ATTR",
        "ERGOTA_BUFFER",
        "ERGOTA_REPLY_DELAY_MS",
        "ERGOTA_TRANSFER_TIMEOUT_MS",
        "ERGOTA_ABORT_TIMEOUT_MS",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_firmware(dir: &tempfile::TempDir, len: usize) -> PathBuf {
    let path = dir.path().join("firmware.bin");
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).expect("write firmware");
    path
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ergota"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ergota"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_ergota()"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_firmware() {
    cli_cmd()
        .arg("simulate")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_zero_cancel_threshold() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 100);

    cli_cmd()
        .arg("simulate")
        .arg(&firmware)
        .args(["--cancel-after-windows", "0"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_one_for_missing_file() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("does_not_exist.bin");

    cli_cmd()
        .arg("info")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn exit_code_one_for_empty_firmware() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 0);

    cli_cmd()
        .arg("info")
        .arg(&firmware)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn exit_code_three_for_zero_attr_in_config() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 100);
    fs::write(dir.path().join("ergota.toml"), "[simulator]\nattr = 0\n").expect("write config");

    cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&firmware)
        .assert()
        .failure()
        .code(3);
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 100);
    fs::write(dir.path().join("ergota.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&firmware)
        .output()
        .expect("command should execute");

    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

// ============================================================================
// info
// ============================================================================

#[test]
fn info_json_reports_plan() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 1024);

    let output = cli_cmd()
        .arg("info")
        .arg(&firmware)
        .args(["--attr", "15", "--buffer", "100", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let info: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(info["ok"], true);
    assert_eq!(info["data"]["size"], 1024);
    assert_eq!(info["data"]["package_count"], 69);
    assert_eq!(info["data"]["window_count"], 12);
}

#[test]
fn info_uses_config_file() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 100);
    let config = dir.path().join("custom.toml");
    fs::write(&config, "[simulator]\nattr = 15\nbuffer = 45\n").expect("write config");

    let output = cli_cmd()
        .arg("--config")
        .arg(&config)
        .arg("info")
        .arg(&firmware)
        .arg("--json")
        .output()
        .expect("command should execute");

    let info: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(info["data"]["package_count"], 7);
    assert_eq!(info["data"]["packages_per_window"], 3);
}

#[test]
fn flags_override_environment() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 100);

    let output = cli_cmd()
        .env("ERGOTA_ATTR", "50")
        .arg("info")
        .arg(&firmware)
        .args(["--attr", "10", "--json"])
        .output()
        .expect("command should execute");

    let info: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(info["data"]["package_count"], 10);
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.bin");

    cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

// ============================================================================
// simulate
// ============================================================================

#[test]
fn simulate_succeeds() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 4096);

    cli_cmd()
        .arg("simulate")
        .arg(&firmware)
        .args(["--attr", "64", "--buffer", "512", "--reply-delay-ms", "0"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Update installed"));
}

#[test]
fn simulate_checksum_fault_exits_four() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 2048);

    cli_cmd()
        .arg("simulate")
        .arg(&firmware)
        .args(["--fault", "checksum", "--reply-delay-ms", "0"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("invalid firmware file"));
}

#[test]
fn simulate_silent_window_times_out() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 2048);

    cli_cmd()
        .arg("simulate")
        .arg(&firmware)
        .args(["--attr", "64", "--buffer", "256"])
        .args(["--fault", "silent-window", "--fault-at", "1"])
        .args(["--transfer-timeout-ms", "200", "--reply-delay-ms", "0"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("device likely disconnected"));
}

#[test]
fn simulate_cancel_after_windows_exits_130() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 4096);

    cli_cmd()
        .arg("simulate")
        .arg(&firmware)
        .args(["--attr", "64", "--buffer", "256", "--reply-delay-ms", "5"])
        .args(["--cancel-after-windows", "2"])
        .assert()
        .failure()
        .code(130)
        .stderr(predicate::str::contains("aborted"));
}

#[test]
fn quiet_simulation_prints_nothing() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = write_firmware(&dir, 1000);

    cli_cmd()
        .arg("-q")
        .arg("simulate")
        .arg(&firmware)
        .args(["--reply-delay-ms", "0"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::is_empty());
}
