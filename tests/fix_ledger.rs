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
    cmd.env_remove("DDCT_PLUGIN_DIR");
    cmd.env_remove("DDCT_STATE_FILE");
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    ddct_cmd(home).args(args).output().expect("run ddct")
}

fn make_temp_home() -> PathBuf {
    static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
    let home = std::env::temp_dir().join(format!("ddct-fix-test-{}-{seq}", std::process::id()));
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

/// Each fix appends its key to the journal file named in the host config.
const FIX_DEMO: &[u8] = br#"
[[fix]]
code = "ABCD0001"
key = "demo-once"
label = "Runs once per host"
run = ["echo demo-once >> {journal}"]

[[fix]]
code = "ABCD0001"
key = "demo-always"
label = "Runs every time"
run = ["echo demo-always >> {journal}"]
repeatable = true

[[fix]]
code = "ABCD0002"
key = "before-boom"
label = "Succeeds"
run = ["echo before-boom >> {journal}"]

[[fix]]
code = "ABCD0002"
key = "boom"
label = "Fails"
run = ["exit 4"]

[[fix]]
code = "ABCD0002"
key = "after-boom"
label = "Never reached"
run = ["echo after-boom >> {journal}"]
"#;

fn seed(home: &Path) -> PathBuf {
    let journal = home.join("journal.txt");
    write_file(
        &home.join(".ddct.json"),
        serde_json::json!({ "mgmt_ip": "127.0.0.1", "journal": journal })
            .to_string()
            .as_bytes(),
    );
    write_file(&home.join(".config/ddct/plugins/fix_demo.toml"), FIX_DEMO);
    journal
}

fn journal_lines(journal: &Path) -> Vec<String> {
    std::fs::read_to_string(journal)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn ledger(home: &Path) -> serde_json::Value {
    let bytes = std::fs::read(home.join(".config/ddct/state.json")).expect("read ledger");
    serde_json::from_slice(&bytes).expect("parse ledger")
}

#[test]
fn applied_keys_are_skipped_on_the_next_run() {
    let home = make_temp_home();
    let journal = seed(&home);

    let first = run(&home, &["fix", "-p", "demo", "ABCD0001"]);
    assert_eq!(first.status.code(), Some(0), "{}", String::from_utf8_lossy(&first.stderr));
    assert_eq!(journal_lines(&journal), vec!["demo-once", "demo-always"]);

    let second = run(&home, &["fix", "-p", "demo", "abcd0001"]);
    assert_eq!(second.status.code(), Some(0));
    assert_eq!(
        journal_lines(&journal),
        vec!["demo-once", "demo-always", "demo-always"]
    );
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("skipped (already applied)"), "{stdout}");

    let v = ledger(&home);
    assert_eq!(v["schema_version"], "1.0");
    assert!(v["applied"]["demo-once"].is_string());
    assert!(v["applied"].get("demo-always").is_none());
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn failing_fix_stops_the_run_persists_the_ledger_and_exits_20() {
    let home = make_temp_home();
    let journal = seed(&home);

    let out = run(&home, &["fix", "-p", "demo", "ABCD0002", "ABCD0001"]);
    assert_eq!(out.status.code(), Some(20));
    assert_eq!(journal_lines(&journal), vec!["before-boom"]);

    let v = ledger(&home);
    assert!(v["applied"]["before-boom"].is_string());
    assert!(v["applied"].get("boom").is_none());
    assert!(v["applied"].get("demo-once").is_none());

    let logs: Vec<PathBuf> = std::fs::read_dir(home.join(".config/ddct/logs"))
        .expect("logs dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    assert_eq!(logs.len(), 1);
    let log: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&logs[0]).expect("read log")).expect("parse log");
    assert_eq!(log["status"], "error");
    assert_eq!(log["outcome"]["failed"]["key"], "boom");
    assert_eq!(log["outcome"]["applied"][0]["key"], "before-boom");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn dry_run_plans_without_side_effects() {
    let home = make_temp_home();
    let journal = seed(&home);

    let out = run(&home, &["fix", "--dry-run", "-p", "demo", "ABCD0001", "FFFF0000"]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("would apply"), "{stdout}");
    assert!(stdout.contains("no fix registered"), "{stdout}");
    assert!(!journal.exists());
    assert!(!home.join(".config/ddct/state.json").exists());
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn list_shows_builtin_and_plugin_fixes() {
    let home = make_temp_home();
    seed(&home);

    let out = run(&home, &["fix", "--list", "-p", "demo"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("9000C3B6"), "{stdout}");
    assert!(stdout.contains("arp-announce"), "{stdout}");
    assert!(stdout.contains("demo-always"), "{stdout}");
    let _ = std::fs::remove_dir_all(&home);
}

#[test]
fn codes_can_come_from_a_saved_report() {
    let home = make_temp_home();
    let journal = seed(&home);
    let report = home.join("report.json");
    write_file(
        &report,
        br#"{
  "host": "h",
  "success": [],
  "warnings": {},
  "failures": { "ABCD0001": ["DEMO", "demo failed"] }
}"#,
    );

    let out = run(
        &home,
        &["fix", "-p", "demo", "--from-report", report.to_str().expect("utf-8 path")],
    );
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(journal_lines(&journal), vec!["demo-once", "demo-always"]);
    let _ = std::fs::remove_dir_all(&home);
}
