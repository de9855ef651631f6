//! CLI argument parsing tests for the `send`/`receive` binaries.
//!
//! These exercise `clap`'s derived parsing only (`--help` always exits 0
//! before any network I/O happens), mirroring the teacher's
//! `cli_parsing_tests.rs` pattern.

use assert_cmd::Command;

#[test]
fn send_help_runs() {
    Command::cargo_bin("send").unwrap().arg("--help").assert().success();
}

#[test]
fn send_version_runs() {
    Command::cargo_bin("send")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn send_requires_at_least_one_path() {
    Command::cargo_bin("send").unwrap().assert().failure();
}

#[test]
fn send_accepts_port_flag() {
    Command::cargo_bin("send")
        .unwrap()
        .args(["--port", "53317", "--help"])
        .assert()
        .success();
}

#[test]
fn send_accepts_short_port_flag() {
    Command::cargo_bin("send")
        .unwrap()
        .args(["-p", "53317", "--help"])
        .assert()
        .success();
}

#[test]
fn send_accepts_timeout_flag() {
    Command::cargo_bin("send")
        .unwrap()
        .args(["--timeout", "60", "--help"])
        .assert()
        .success();
}

#[test]
fn send_accepts_verbose_flags() {
    Command::cargo_bin("send")
        .unwrap()
        .args(["-vvv", "--help"])
        .assert()
        .success();
}

#[test]
fn send_accepts_quiet_flag() {
    Command::cargo_bin("send")
        .unwrap()
        .args(["-q", "--help"])
        .assert()
        .success();
}

#[test]
fn send_rejects_nonexistent_path() {
    Command::cargo_bin("send")
        .unwrap()
        .arg("/no/such/path/surely-does-not-exist")
        .assert()
        .failure();
}

#[test]
fn receive_help_runs() {
    Command::cargo_bin("receive")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn receive_version_runs() {
    Command::cargo_bin("receive")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn receive_requires_code_phrase() {
    Command::cargo_bin("receive").unwrap().assert().failure();
}

#[test]
fn receive_rejects_malformed_code_phrase() {
    Command::cargo_bin("receive")
        .unwrap()
        .arg("not-a-valid-phrase-at-all")
        .assert()
        .failure();
}

#[test]
fn receive_accepts_output_dir_flag() {
    Command::cargo_bin("receive")
        .unwrap()
        .args(["swift-ocean", "--output", "/tmp", "--help"])
        .assert()
        .success();
}

#[test]
fn receive_accepts_auto_accept_flag() {
    Command::cargo_bin("receive")
        .unwrap()
        .args(["swift-ocean", "-y", "--help"])
        .assert()
        .success();
}

#[test]
fn receive_accepts_timeout_flag() {
    Command::cargo_bin("receive")
        .unwrap()
        .args(["swift-ocean", "--timeout", "60", "--help"])
        .assert()
        .success();
}
