#![forbid(unsafe_code)]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn marionette() -> Command {
	let mut cmd = Command::cargo_bin("marionette").unwrap();
	cmd.env_remove("RUST_LOG").env_remove("MARIONETTE_FORMAT").env_remove("MARIONETTE_FORMAT_DIR").env_remove("MARIONETTE_LOG_LEVEL");
	cmd
}

#[test]
fn help_lists_commands() {
	marionette()
		.arg("--help")
		.assert()
		.success()
		.stdout(predicate::str::contains("pt-client").and(predicate::str::contains("formats")));
}

#[test]
fn unknown_command_exits_with_one() {
	marionette().arg("frobnicate").assert().code(1);
}

#[test]
fn formats_lists_builtins() {
	marionette()
		.arg("formats")
		.assert()
		.success()
		.stdout(predicate::str::contains("dummy:20150701").and(predicate::str::contains("ftp_pasv:20150701")));
}

#[test]
fn format_dir_adds_formats() {
	let dir = tempfile::tempdir().unwrap();
	let fmt = dir.path().join("custom");
	std::fs::create_dir(&fmt).unwrap();
	std::fs::write(
		fmt.join("20240101.toml"),
		"transport = \"tcp\"\nport = 1\n[[transitions]]\nsource = \"start\"\ndestination = \"end\"\naction_block = \"NULL\"\nprobability = 1.0\n",
	)
	.unwrap();
	marionette()
		.arg("--format-dir")
		.arg(dir.path())
		.arg("formats")
		.assert()
		.success()
		.stdout(predicate::str::contains("custom:20240101").and(predicate::str::contains("dummy:20150701")));
}

#[test]
fn invalid_config_file_fails() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("marionette.toml");
	std::fs::write(&path, "log_level = \"loud\"\n").unwrap();
	marionette()
		.arg("--config")
		.arg(&path)
		.arg("formats")
		.assert()
		.code(1)
		.stderr(predicate::str::contains("log_level"));
}

#[test]
fn unknown_format_fails() {
	marionette()
		.args(["client", "--format", "no_such_format", "--bind", "127.0.0.1:0"])
		.assert()
		.code(1)
		.stderr(predicate::str::contains("no_such_format"));
}

#[test]
fn pt_client_without_version_reports_error() {
	marionette()
		.arg("pt-client")
		.env_remove("TOR_PT_MANAGED_TRANSPORT_VER")
		.assert()
		.code(1)
		.stdout(predicate::str::contains("VERSION-ERROR no-version"));
}

#[test]
fn pt_server_not_requested() {
	marionette()
		.arg("pt-server")
		.env("TOR_PT_MANAGED_TRANSPORT_VER", "1")
		.env("TOR_PT_SERVER_TRANSPORTS", "obfs4")
		.env("TOR_PT_ORPORT", "127.0.0.1:9000")
		.assert()
		.success()
		.stdout(predicate::str::contains("VERSION 1").and(predicate::str::contains("SMETHODS DONE")));
}
