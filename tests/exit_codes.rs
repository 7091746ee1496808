use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};

fn ddct_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ddct"));
    cmd.current_dir(home);
    cmd.env("HOME", home);
    cmd.env_remove("SUDO_UID");
    cmd.env_remove("DDCT_CONFIG");
    cmd.env_remove("DDCT_CONFIG_FILE");
    cmd.env_remove("DDCT_LOG");
    cmd.env_remove("DDCT_UI_COLOR");
    cmd.env_remove("DDCT_REPORT_WARNINGS");
    cmd.env_remove("DDCT_REPORT_WRAP");
    cmd.env_remove("DDCT_PLUGIN_DIR");
    cmd.env_remove("DDCT_STATE_FILE");
    cmd.env_remove("DDCT_MAX_WORKERS");
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    ddct_cmd(home).args(args).output().expect("run ddct")
}

fn make_temp_home() -> PathBuf {
    static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
    let home = std::env::temp_dir().join(format!("ddct-exit-test-{}-{seq}", std::process::id()));
    let _ = std::fs::remove_dir_all(&home);
    std::fs::create_dir_all(&home).expect("create home");
    home
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdirs");
    }
    std::fs::write(path, bytes).expect("write");
}

fn plugin_dir(home: &Path) -> PathBuf {
    home.join(".config/ddct/plugins")
}

/// A host configuration plus one check plugin whose only probe leaves a
/// marker file behind when it runs.
fn seed(home: &Path) -> (PathBuf, PathBuf) {
    let marker = home.join("probe-ran");
    let host_config = home.join(".ddct.json");
    write_file(
        &host_config,
        serde_json::json!({ "mgmt_ip": "127.0.0.1", "marker": marker })
            .to_string()
            .as_bytes(),
    );
    write_file(
        &plugin_dir(home).join("check_probe.toml"),
        br#"
[[check]]
name = "PROBE"
tags = ["ddct-test"]

[[check.probe]]
run = "touch {marker}"
code = "ABCD0010"
message = "could not touch the marker"
"#,
    );
    (host_config, marker)
}

#[test]
fn completion_unknown_shell_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["completion", "nope"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn check_without_host_config_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["check", "--tags", "ddct-test"]);
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no host configuration found"), "{stderr}");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn check_with_missing_explicit_config_file_exits_2() {
    let home = make_temp_home();
    let out = run(
        &home,
        &["--config-file", "does-not-exist.json", "check", "--tags", "ddct-test"],
    );
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn unknown_check_plugin_exits_2_before_any_rule_runs() {
    let home = make_temp_home();
    let (_, marker) = seed(&home);

    let out = run(
        &home,
        &["check", "--tags", "ddct-test", "--use-plugins", "probe,bogus"],
    );
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("unrecognized check plugin requested: bogus"),
        "{stderr}"
    );
    assert!(stderr.contains("probe"), "available plugins listed: {stderr}");
    assert!(!marker.exists(), "no rule may run after a plugin error");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn known_check_plugin_runs() {
    let home = make_temp_home();
    let (_, marker) = seed(&home);

    let out = run(
        &home,
        &["check", "--tags", "ddct-test", "--use-plugins", "probe", "--json"],
    );
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(marker.exists());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse json");
    assert_eq!(v["success"], serde_json::json!(["PROBE"]));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn unknown_fix_plugin_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["fix", "--dry-run", "--use-plugins", "nothing", "9000C3B6"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn unknown_installer_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["install", "nothing"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn malformed_fix_code_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["fix", "--dry-run", "not-a-code"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn fix_without_codes_exits_2() {
    let home = make_temp_home();
    let out = run(&home, &["fix"]);
    assert_eq!(out.status.code(), Some(2));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn strict_check_with_failures_exits_10() {
    let home = make_temp_home();
    seed(&home);
    write_file(
        &plugin_dir(&home).join("check_broken.toml"),
        br#"
[[check]]
name = "BROKEN"
tags = ["ddct-test"]

[[check.probe]]
run = "false"
code = "ABCD0011"
message = "always fails"
"#,
    );

    let lenient = run(
        &home,
        &["check", "--tags", "ddct-test", "--use-plugins", "broken"],
    );
    assert_eq!(lenient.status.code(), Some(0));

    let strict = run(
        &home,
        &["check", "--strict", "--tags", "ddct-test", "--use-plugins", "broken"],
    );
    assert_eq!(strict.status.code(), Some(10));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn failing_install_step_exits_20() {
    let home = make_temp_home();
    write_file(
        &plugin_dir(&home).join("install_broken.toml"),
        b"description = \"broken\"\nsteps = [\"exit 3\"]\n",
    );
    let out = run(&home, &["install", "broken"]);
    assert_eq!(out.status.code(), Some(20));
    let logs = std::fs::read_dir(home.join(".config/ddct/logs"))
        .expect("logs dir")
        .count();
    assert_eq!(logs, 1);
    let _ = std::fs::remove_dir_all(&home);
}
