use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::HostConfig;
use crate::core::Code;
use crate::engine::panic_message;

pub mod builtin;
mod ledger;

pub use ledger::AppliedFixLedger;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Clone)]
pub enum FixProc {
    Plain(Arc<dyn Fn() -> Result<()> + Send + Sync>),
    WithConfig(Arc<dyn Fn(&HostConfig) -> Result<()> + Send + Sync>),
}

#[derive(Clone)]
pub struct FixAction {
    key: String,
    label: String,
    body: FixProc,
    idempotent: bool,
}

impl fmt::Debug for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixAction")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

impl FixAction {
    pub fn plain<F>(key: impl Into<String>, label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            label: label.into(),
            body: FixProc::Plain(Arc::new(f)),
            idempotent: true,
        }
    }

    pub fn with_config<F>(key: impl Into<String>, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&HostConfig) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            label: label.into(),
            body: FixProc::WithConfig(Arc::new(f)),
            idempotent: true,
        }
    }

    /// Placeholder for codes that have no automatic remedy. Never recorded.
    pub fn no_fix(label: impl Into<String>) -> Self {
        Self {
            key: "no-fix".to_string(),
            label: label.into(),
            body: FixProc::Plain(Arc::new(|| {
                tracing::info!("no automatic fix for this code");
                Ok(())
            })),
            idempotent: false,
        }
    }

    pub fn repeatable(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn apply(&self, config: &HostConfig) -> Result<()> {
        match &self.body {
            FixProc::Plain(f) => f(),
            FixProc::WithConfig(f) => f(config),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixRegistry {
    entries: BTreeMap<Code, Vec<FixAction>>,
}

impl FixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: impl Into<Code>, fixes: Vec<FixAction>) {
        self.entries.insert(code.into(), fixes);
    }

    pub fn merge(&mut self, other: FixRegistry) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, code: &Code) -> Option<&[FixAction]> {
        self.entries.get(code).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Code, &[FixAction])> {
        self.entries.iter().map(|(c, f)| (c, f.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixStep {
    pub code: String,
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    #[serde(flatten)]
    pub step: FixStep,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixRunOutcome {
    pub dry_run: bool,
    pub applied: Vec<FixStep>,
    pub skipped: Vec<FixStep>,
    pub unfixable: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<FailedStep>,
}

impl FixRunOutcome {
    pub fn status(&self) -> &'static str {
        if self.failed.is_some() {
            "error"
        } else if self.dry_run {
            "planned"
        } else {
            "ok"
        }
    }
}

#[derive(Debug, Error)]
pub enum FixError {
    #[error("fix `{key}` for code {code} failed")]
    Action {
        code: Code,
        key: String,
        #[source]
        source: BoxError,
        outcome: Box<FixRunOutcome>,
    },
    #[error("applied-fix ledger is unusable: {path}")]
    Ledger {
        path: String,
        #[source]
        source: BoxError,
    },
}

impl FixError {
    pub fn outcome(&self) -> Option<&FixRunOutcome> {
        match self {
            FixError::Action { outcome, .. } => Some(outcome),
            FixError::Ledger { .. } => None,
        }
    }
}

pub struct Dispatcher<'a> {
    registry: &'a FixRegistry,
    ledger_path: &'a Path,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a FixRegistry, ledger_path: &'a Path) -> Self {
        Self {
            registry,
            ledger_path,
        }
    }

    fn load_ledger(&self) -> Result<AppliedFixLedger, FixError> {
        AppliedFixLedger::load(self.ledger_path).map_err(|err| FixError::Ledger {
            path: self.ledger_path.display().to_string(),
            source: err.into(),
        })
    }

    pub fn plan(&self, codes: &[Code]) -> Result<FixRunOutcome, FixError> {
        let ledger = self.load_ledger()?;
        let mut outcome = FixRunOutcome {
            dry_run: true,
            ..FixRunOutcome::default()
        };
        for code in codes {
            let Some(fixes) = self.registry.get(code) else {
                outcome.unfixable.push(code.to_string());
                continue;
            };
            for fix in fixes {
                let step = step_for(code, fix);
                if fix.is_idempotent() && ledger.contains(fix.key()) {
                    outcome.skipped.push(step);
                } else {
                    outcome.applied.push(step);
                }
            }
        }
        Ok(outcome)
    }

    /// Applies fixes code by code in input order. The ledger is written back
    /// whether the run succeeds or stops at a failing fix.
    pub fn run(&self, codes: &[Code], config: &HostConfig) -> Result<FixRunOutcome, FixError> {
        let mut ledger = self.load_ledger()?;
        let mut outcome = FixRunOutcome::default();
        let mut failure: Option<(Code, String, anyhow::Error)> = None;

        'codes: for code in codes {
            let Some(fixes) = self.registry.get(code) else {
                tracing::info!(%code, "no fix registered");
                outcome.unfixable.push(code.to_string());
                continue;
            };
            for fix in fixes {
                let step = step_for(code, fix);
                if fix.is_idempotent() && ledger.contains(fix.key()) {
                    tracing::debug!(%code, key = fix.key(), "already applied, skipping");
                    outcome.skipped.push(step);
                    continue;
                }
                tracing::info!(%code, key = fix.key(), "applying fix");
                let applied = catch_unwind(AssertUnwindSafe(|| fix.apply(config)))
                    .unwrap_or_else(|payload| {
                        Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())))
                    });
                match applied {
                    Ok(()) => {
                        if fix.is_idempotent() {
                            ledger.mark_applied(fix.key(), OffsetDateTime::now_utc());
                        }
                        outcome.applied.push(step);
                    }
                    Err(err) => {
                        tracing::error!(%code, key = fix.key(), error = %format!("{err:#}"), "fix failed");
                        outcome.failed = Some(FailedStep {
                            step,
                            error: format!("{err:#}"),
                        });
                        failure = Some((code.clone(), fix.key().to_string(), err));
                        break 'codes;
                    }
                }
            }
        }

        let persisted = ledger.persist();
        if let Some((code, key, err)) = failure {
            if let Err(persist_err) = persisted {
                tracing::error!(error = %format!("{persist_err:#}"), "ledger could not be persisted");
            }
            return Err(FixError::Action {
                code,
                key,
                source: err.into(),
                outcome: Box::new(outcome),
            });
        }
        persisted.map_err(|err| FixError::Ledger {
            path: self.ledger_path.display().to_string(),
            source: err.into(),
        })?;
        Ok(outcome)
    }
}

fn step_for(code: &Code, fix: &FixAction) -> FixStep {
    FixStep {
        code: code.to_string(),
        key: fix.key().to_string(),
        label: fix.label().to_string(),
    }
}
