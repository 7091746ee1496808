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
    let home = std::env::temp_dir().join(format!("ddct-check-test-{}-{seq}", std::process::id()));
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

const CHECK_SITE: &[u8] = br#"
[[check]]
name = "MARKER"
tags = ["ddct-test", "site"]

[[check.probe]]
run = "test -e {marker}"
code = "ABCD0001"
message = "marker {marker} is missing"
fix = "touch {marker}"

[[check]]
name = "ADVISORY"
tags = ["ddct-test"]

[[check.probe]]
run = "false"
severity = "warn"
code = "ABCD0003"
message = "advisory only"

[[check]]
name = "NEVER"
tags = ["ddct-test", "slow"]

[[check.probe]]
run = "false"
code = "ABCD0004"
message = "excluded by tag"
"#;

const FIX_SITE: &[u8] = br#"
[[fix]]
code = "ABCD0001"
key = "site-marker"
label = "Creates the marker"
run = ["touch {marker}"]
"#;

fn seed(home: &Path) -> PathBuf {
    let marker = home.join("marker");
    write_file(
        &home.join(".ddct.json"),
        serde_json::json!({ "mgmt_ip": "127.0.0.1", "marker": marker })
            .to_string()
            .as_bytes(),
    );
    write_file(&home.join(".config/ddct/plugins/check_site.toml"), CHECK_SITE);
    write_file(&home.join(".config/ddct/plugins/fix_site.toml"), FIX_SITE);
    marker
}

fn check_json(home: &Path, extra: &[&str]) -> (Output, serde_json::Value) {
    let mut args = vec![
        "check",
        "--json",
        "--tags",
        "ddct-test",
        "--not-tags",
        "slow",
        "--use-plugins",
        "site",
    ];
    args.extend_from_slice(extra);
    let out = run(home, &args);
    let v = serde_json::from_slice(&out.stdout).unwrap_or(serde_json::Value::Null);
    (out, v)
}

#[test]
fn plugin_checks_land_in_one_partition_each() {
    let home = make_temp_home();
    let marker = seed(&home);

    let (out, v) = check_json(&home, &[]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(
        v["failures"]["ABCD0001"],
        serde_json::json!(["MARKER", format!("marker {} is missing", marker.display())])
    );
    assert_eq!(
        v["warnings"]["ABCD0003"],
        serde_json::json!(["ADVISORY", "advisory only"])
    );
    assert_eq!(v["success"], serde_json::json!([]));
    assert!(v["failures"].get("ABCD0004").is_none(), "excluded check ran");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn no_warnings_hides_warnings_from_the_report() {
    let home = make_temp_home();
    seed(&home);

    let (out, v) = check_json(&home, &["--no-warnings"]);
    assert!(out.status.success());
    assert_eq!(v["warnings"], serde_json::json!({}));
    assert_eq!(v["success"], serde_json::json!(["ADVISORY"]));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn check_fix_repairs_and_a_second_check_passes() {
    let home = make_temp_home();
    let marker = seed(&home);

    let (out, _) = check_json(&home, &["--fix", "--use-fix-plugins", "site"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(marker.exists());

    let (out, v) = check_json(&home, &["--strict"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(v["success"], serde_json::json!(["MARKER"]));
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn text_report_lists_names_codes_and_fix_hints() {
    let home = make_temp_home();
    seed(&home);

    let out = run(
        &home,
        &["check", "--tags", "site", "--use-plugins", "site", "--no-wrap"],
    );
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("HOST: "), "{stdout}");
    assert!(stdout.contains("MARKER"), "{stdout}");
    assert!(stdout.contains("FAIL"), "{stdout}");
    assert!(stdout.contains("ABCD0001"), "{stdout}");
    assert!(stdout.contains("touch"), "{stdout}");
    assert!(!stdout.contains("ADVISORY"), "{stdout}");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn out_file_round_trips_into_fix_from_report() {
    let home = make_temp_home();
    let marker = seed(&home);
    let saved = home.join("saved-report.json");

    let out = run(
        &home,
        &[
            "check",
            "--quiet",
            "--tags",
            "site",
            "--use-plugins",
            "site",
            "--out",
            saved.to_str().expect("utf-8 path"),
        ],
    );
    assert!(out.status.success());
    assert!(saved.exists());

    let fix = run(
        &home,
        &["fix", "-p", "site", "--from-report", saved.to_str().expect("utf-8 path")],
    );
    assert_eq!(fix.status.code(), Some(0), "{}", String::from_utf8_lossy(&fix.stderr));
    assert!(marker.exists());
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn tags_and_plugins_listings_include_plugins() {
    let home = make_temp_home();
    seed(&home);

    let tags = run(&home, &["tags", "-p", "site"]);
    assert!(tags.status.success());
    let tags = String::from_utf8_lossy(&tags.stdout);
    let listed: Vec<&str> = tags.lines().collect();
    assert!(listed.contains(&"site"), "{tags}");
    assert!(listed.contains(&"multipath"), "{tags}");

    let plugins = run(&home, &["plugins"]);
    assert!(plugins.status.success());
    let plugins = String::from_utf8_lossy(&plugins.stdout);
    assert!(plugins.contains("Check Plugins"), "{plugins}");
    assert!(plugins.contains("check_site.toml"), "{plugins}");
    assert!(plugins.contains("fix_site.toml"), "{plugins}");
    let _ = std::fs::remove_dir_all(&home);
}
