use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: String,
    #[serde(default)]
    applied: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AppliedFixLedger {
    path: PathBuf,
    applied: BTreeMap<String, String>,
}

impl AppliedFixLedger {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            applied: BTreeMap::new(),
        }
    }

    /// A missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty(path));
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fix ledger: {}", path.display()))?;
        let file: LedgerFile = serde_json::from_str(&s)
            .with_context(|| format!("failed to parse fix ledger (JSON): {}", path.display()))?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported fix ledger schema_version: {} (expected {SCHEMA_VERSION})",
                file.schema_version
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            applied: file.applied,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &str) -> bool {
        self.applied.contains_key(key)
    }

    pub fn mark_applied(&mut self, key: &str, at: OffsetDateTime) {
        let stamp = at.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string());
        self.applied.insert(key.to_string(), stamp);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.applied.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn persist(&self) -> Result<()> {
        let file = LedgerFile {
            schema_version: SCHEMA_VERSION.to_string(),
            applied: self.applied.clone(),
        };
        let buf = serde_json::to_vec_pretty(&file).context("failed to serialize fix ledger")?;
        crate::platform::write_atomic(&self.path, &buf)?;
        tracing::debug!(path = %self.path.display(), keys = self.applied.len(), "ledger persisted");
        Ok(())
    }
}
