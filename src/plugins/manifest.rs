use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::config::HostConfig;
use crate::core::Code;
use crate::fixes::{FixAction, FixRegistry};
use crate::platform;
use crate::rules::Rule;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckManifest {
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "probe")]
    pub probes: Vec<ProbeSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expect {
    #[default]
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSeverity {
    #[default]
    Fail,
    Warn,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSpec {
    pub run: String,
    #[serde(default)]
    pub expect: Expect,
    #[serde(default)]
    pub severity: ProbeSeverity,
    pub code: String,
    pub message: String,
    pub fix: Option<String>,
    /// Skip the remaining probes of this check when this one is unmet.
    #[serde(default)]
    pub stop: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixManifest {
    #[serde(default, rename = "fix")]
    pub fixes: Vec<FixSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixSpec {
    pub code: String,
    pub key: String,
    pub label: String,
    pub run: Vec<String>,
    #[serde(default)]
    pub repeatable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallManifest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requires: Vec<String>,
    pub steps: Vec<String>,
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest: {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("failed to parse manifest (TOML): {}", path.display()))
}

fn checked_code(raw: &str) -> Result<Code> {
    raw.parse::<Code>().map_err(|e| anyhow!(e))
}

impl CheckManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let manifest: Self = read_toml(path)?;
        for check in &manifest.checks {
            for probe in &check.probes {
                checked_code(&probe.code)
                    .with_context(|| format!("check `{}`", check.name))?;
            }
        }
        Ok(manifest)
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.checks.into_iter().map(CheckSpec::into_rule).collect()
    }
}

impl CheckSpec {
    fn into_rule(self) -> Rule {
        let CheckSpec { name, tags, probes } = self;
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        Rule::new(name, &tags, move |ctx| {
            for probe in &probes {
                let cmd = ctx.config().expand(&probe.run)?;
                let timeout = probe
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(platform::DEFAULT_COMMAND_TIMEOUT);
                let succeeded = match platform::run_shell(&cmd, timeout) {
                    Ok(out) => out.success(),
                    Err(err) => {
                        tracing::debug!(rule = ctx.name(), error = %err, "probe did not complete");
                        false
                    }
                };
                let met = match probe.expect {
                    Expect::Success => succeeded,
                    Expect::Failure => !succeeded,
                };
                if met {
                    continue;
                }
                let message = ctx.config().expand(&probe.message)?;
                let fix = probe
                    .fix
                    .as_deref()
                    .map(|f| ctx.config().expand(f))
                    .transpose()?;
                match (probe.severity, fix) {
                    (ProbeSeverity::Fail, Some(fix)) => ctx.fail_with_fix(message, &probe.code, fix),
                    (ProbeSeverity::Fail, None) => ctx.fail(message, &probe.code),
                    (ProbeSeverity::Warn, Some(fix)) => ctx.warn_with_fix(message, &probe.code, fix),
                    (ProbeSeverity::Warn, None) => ctx.warn(message, &probe.code),
                }
                if probe.stop {
                    break;
                }
            }
            Ok(())
        })
    }
}

impl FixManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let manifest: Self = read_toml(path)?;
        for fix in &manifest.fixes {
            checked_code(&fix.code).with_context(|| format!("fix `{}`", fix.key))?;
            if fix.key.trim().is_empty() {
                return Err(anyhow!("fix for code {} has an empty key", fix.code));
            }
        }
        Ok(manifest)
    }

    pub fn into_registry(self) -> FixRegistry {
        let mut grouped: Vec<(Code, Vec<FixAction>)> = Vec::new();
        for spec in self.fixes {
            let code = Code::new(&spec.code);
            let action = spec.into_action();
            match grouped.iter_mut().find(|(c, _)| *c == code) {
                Some((_, actions)) => actions.push(action),
                None => grouped.push((code, vec![action])),
            }
        }
        let mut registry = FixRegistry::new();
        for (code, actions) in grouped {
            registry.insert(code, actions);
        }
        registry
    }
}

impl FixSpec {
    fn into_action(self) -> FixAction {
        let commands = self.run;
        let action = FixAction::with_config(self.key, self.label, move |cfg: &HostConfig| {
            run_steps(&commands, cfg)
        });
        if self.repeatable {
            action.repeatable()
        } else {
            action
        }
    }
}

pub fn run_steps(steps: &[String], cfg: &HostConfig) -> Result<()> {
    for step in steps {
        let cmd = cfg.expand(step)?;
        tracing::info!(cmd = %cmd, "running step");
        platform::shell_output(&cmd)?;
    }
    Ok(())
}

impl InstallManifest {
    pub fn load(path: &Path) -> Result<Self> {
        read_toml(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_manifest_defaults_apply() {
        let m: CheckManifest = toml::from_str(
            r#"
[[check]]
name = "Docker Volume"
tags = ["driver", "plugin", "local"]

[[check.probe]]
run = "docker ps >/dev/null 2>&1"
code = "42BAAC76"
message = "Docker is not installed"
"#,
        )
        .expect("parse");
        let probe = &m.checks[0].probes[0];
        assert_eq!(probe.expect, Expect::Success);
        assert_eq!(probe.severity, ProbeSeverity::Fail);
        assert!(!probe.stop);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed: std::result::Result<FixManifest, _> = toml::from_str(
            r#"
[[fix]]
code = "ABCD0001"
key = "k"
label = "l"
run = ["true"]
shell = "bash"
"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn fix_manifest_groups_by_code_in_order() {
        let m: FixManifest = toml::from_str(
            r#"
[[fix]]
code = "abcd0001"
key = "first"
label = "first"
run = ["true"]

[[fix]]
code = "ABCD0001"
key = "second"
label = "second"
run = ["true"]
repeatable = true
"#,
        )
        .expect("parse");
        let registry = m.into_registry();
        let fixes = registry.get(&Code::new("ABCD0001")).expect("code");
        let keys: Vec<&str> = fixes.iter().map(FixAction::key).collect();
        assert_eq!(keys, vec!["first", "second"]);
        assert!(fixes[0].is_idempotent());
        assert!(!fixes[1].is_idempotent());
    }
}
