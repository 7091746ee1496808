use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::Code;
use crate::fixes::FixRunOutcome;

const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct FixRunLog<'a> {
    schema_version: &'static str,
    tool_version: &'static str,
    command: &'static str,
    started_at: String,
    finished_at: String,
    status: &'static str,
    ledger: String,
    requested_codes: Vec<String>,
    outcome: &'a FixRunOutcome,
}

#[derive(Debug, Serialize)]
struct InstallLog<'a> {
    schema_version: &'static str,
    tool_version: &'static str,
    command: &'static str,
    started_at: String,
    finished_at: String,
    status: &'static str,
    requested: &'a [String],
    completed: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn logs_dir(home_dir: &Path) -> PathBuf {
    crate::config::config_dir(home_dir).join("logs")
}

pub fn write_fix_run_log(
    home_dir: &Path,
    started_at: OffsetDateTime,
    finished_at: OffsetDateTime,
    ledger_path: &Path,
    codes: &[Code],
    outcome: &FixRunOutcome,
) -> Result<PathBuf> {
    let log = FixRunLog {
        schema_version: SCHEMA_VERSION,
        tool_version: env!("CARGO_PKG_VERSION"),
        command: "fix",
        started_at: rfc3339(started_at),
        finished_at: rfc3339(finished_at),
        status: outcome.status(),
        ledger: mask_home(ledger_path, home_dir),
        requested_codes: codes.iter().map(Code::to_string).collect(),
        outcome,
    };
    write_log(home_dir, "fix-run", finished_at, &log)
}

pub fn write_install_log(
    home_dir: &Path,
    started_at: OffsetDateTime,
    finished_at: OffsetDateTime,
    requested: &[String],
    completed: &[String],
    error: Option<&anyhow::Error>,
) -> Result<PathBuf> {
    let log = InstallLog {
        schema_version: SCHEMA_VERSION,
        tool_version: env!("CARGO_PKG_VERSION"),
        command: "install",
        started_at: rfc3339(started_at),
        finished_at: rfc3339(finished_at),
        status: if error.is_some() { "error" } else { "ok" },
        requested,
        completed,
        error: error.map(|e| format!("{e:#}")),
    };
    write_log(home_dir, "install", finished_at, &log)
}

fn write_log<T: Serialize>(
    home_dir: &Path,
    prefix: &str,
    finished_at: OffsetDateTime,
    log: &T,
) -> Result<PathBuf> {
    let dir = logs_dir(home_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = finished_at.unix_timestamp_nanos();
    let path = dir.join(format!("{prefix}-{pid}-{ts}.json"));

    let buf = serde_json::to_vec_pretty(log).context("failed to serialize log (JSON)")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write log: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "log written");
    Ok(path)
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}

fn mask_home(path: &Path, home_dir: &Path) -> String {
    let Ok(stripped) = path.strip_prefix(home_dir) else {
        return path.display().to_string();
    };
    let stripped = stripped.display().to_string();
    if stripped.is_empty() {
        "~".to_string()
    } else {
        format!("~/{stripped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixes::{FailedStep, FixStep};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_home(tag: &str) -> PathBuf {
        static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
        let home = std::env::temp_dir().join(format!("ddct-log-{tag}-{}-{seq}", std::process::id()));
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).expect("create home");
        home
    }

    fn step(code: &str, key: &str) -> FixStep {
        FixStep {
            code: code.to_string(),
            key: key.to_string(),
            label: format!("label for {key}"),
        }
    }

    #[test]
    fn fix_run_log_records_failure_and_masks_home() {
        let home = temp_home("fix-run");
        let outcome = FixRunOutcome {
            dry_run: false,
            applied: vec![step("9000C3B6", "arp-announce")],
            skipped: vec![step("BDB4D5D8", "arp-ignore")],
            unfixable: vec!["3C47368".to_string()],
            failed: Some(FailedStep {
                step: step("A06CD19F", "route-gc-interval"),
                error: "permission denied".to_string(),
            }),
        };
        let started = OffsetDateTime::UNIX_EPOCH;
        let path = write_fix_run_log(
            &home,
            started,
            started,
            &home.join(".config/ddct/state.json"),
            &[Code::new("9000C3B6"), Code::new("A06CD19F")],
            &outcome,
        )
        .expect("write log");

        assert!(path.starts_with(logs_dir(&home)));
        let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        assert!(file_name.starts_with("fix-run-"), "{file_name}");

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(v["command"], "fix");
        assert_eq!(v["status"], "error");
        assert_eq!(v["started_at"], "1970-01-01T00:00:00Z");
        assert_eq!(v["ledger"], "~/.config/ddct/state.json");
        assert_eq!(v["requested_codes"][1], "A06CD19F");
        assert_eq!(v["outcome"]["failed"]["key"], "route-gc-interval");
        assert_eq!(v["outcome"]["failed"]["error"], "permission denied");
        assert_eq!(v["outcome"]["skipped"][0]["key"], "arp-ignore");

        let _ = std::fs::remove_dir_all(&home);
    }

    #[test]
    fn install_log_lists_completed_installers() {
        let home = temp_home("install");
        let requested = vec!["docker".to_string(), "k8s".to_string()];
        let completed = vec!["docker".to_string()];
        let err = anyhow::anyhow!("step exited with 1");
        let now = OffsetDateTime::now_utc();
        let path = write_install_log(&home, now, now, &requested, &completed, Some(&err))
            .expect("write log");

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(v["status"], "error");
        assert_eq!(v["completed"], serde_json::json!(["docker"]));
        assert_eq!(v["error"], "step exited with 1");

        let _ = std::fs::remove_dir_all(&home);
    }
}
