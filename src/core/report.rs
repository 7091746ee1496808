use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::core::{Code, Finding, Issue, Severity, Status};

const DEFAULT_REASON_WIDTH: usize = 30;

#[derive(Debug)]
pub struct Report {
    host: Option<String>,
    state: Mutex<ReportState>,
}

#[derive(Debug, Clone)]
struct ReportState {
    warnings_enabled: bool,
    wrap: bool,
    entries: BTreeMap<String, NameEntry>,
    code_index: BTreeMap<Code, (String, String)>,
    fix_index: BTreeMap<Code, String>,
    suppressed: BTreeMap<Code, (String, String)>,
}

#[derive(Debug, Clone, Default)]
struct NameEntry {
    tags: BTreeSet<String>,
    issues: Vec<Issue>,
}

impl NameEntry {
    fn status(&self) -> Status {
        if self.issues.iter().any(|i| i.severity == Severity::Failure) {
            Status::Failure
        } else if self.issues.is_empty() {
            Status::Success
        } else {
            Status::Warning
        }
    }
}

impl Default for ReportState {
    fn default() -> Self {
        Self {
            warnings_enabled: true,
            wrap: true,
            entries: BTreeMap::new(),
            code_index: BTreeMap::new(),
            fix_index: BTreeMap::new(),
            suppressed: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub host: String,
    pub success: Vec<String>,
    pub warnings: BTreeMap<String, (String, String)>,
    pub failures: BTreeMap<String, (String, String)>,
}

impl ReportDocument {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn codes(&self) -> Vec<Code> {
        self.failures
            .keys()
            .chain(self.warnings.keys())
            .map(Code::new)
            .collect()
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            host: None,
            state: Mutex::new(ReportState::default()),
        }
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            state: Mutex::new(ReportState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_warnings_enabled(&self, enabled: bool) {
        self.lock().warnings_enabled = enabled;
    }

    pub fn warnings_enabled(&self) -> bool {
        self.lock().warnings_enabled
    }

    pub fn set_wrap(&self, wrap: bool) {
        self.lock().wrap = wrap;
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        let warnings_enabled = state.warnings_enabled;
        let wrap = state.wrap;
        *state = ReportState {
            warnings_enabled,
            wrap,
            ..ReportState::default()
        };
    }

    pub fn record(&self, name: &str, tags: &[String], finding: Finding) {
        match finding {
            Finding::Success => self.record_success(name, tags),
            Finding::Warning {
                message,
                code,
                fix_hint,
            } => self.record_warning(name, &message, code, tags, fix_hint.as_deref()),
            Finding::Failure {
                message,
                code,
                fix_hint,
            } => self.record_failure(name, &message, code, tags, fix_hint.as_deref()),
        }
    }

    pub fn record_success(&self, name: &str, tags: &[String]) {
        let mut state = self.lock();
        let entry = state.entries.entry(name.to_string()).or_default();
        entry.tags.extend(tags.iter().cloned());
    }

    pub fn record_warning(
        &self,
        name: &str,
        message: &str,
        code: impl Into<Code>,
        tags: &[String],
        fix_hint: Option<&str>,
    ) {
        let code = code.into();
        let mut state = self.lock();
        if !state.warnings_enabled {
            state
                .suppressed
                .insert(code, (name.to_string(), message.to_string()));
            return;
        }
        state.push_issue(name, tags, Severity::Warning, code, message, fix_hint);
    }

    pub fn record_failure(
        &self,
        name: &str,
        message: &str,
        code: impl Into<Code>,
        tags: &[String],
        fix_hint: Option<&str>,
    ) {
        let mut state = self.lock();
        state.push_issue(name, tags, Severity::Failure, code.into(), message, fix_hint);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.lock()
            .entries
            .values()
            .any(|e| e.status() == Status::Failure)
    }

    pub fn status_of(&self, name: &str) -> Option<Status> {
        self.lock().entries.get(name).map(NameEntry::status)
    }

    pub fn tags_of(&self, name: &str) -> Vec<String> {
        self.lock()
            .entries
            .get(name)
            .map(|e| e.tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn issues_of(&self, name: &str) -> Vec<Issue> {
        self.lock()
            .entries
            .get(name)
            .map(|e| e.issues.clone())
            .unwrap_or_default()
    }

    pub fn partition(&self, status: Status) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.status() == status)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn lookup(&self, code: &Code) -> Option<(String, String)> {
        let state = self.lock();
        state
            .code_index
            .get(code)
            .or_else(|| state.suppressed.get(code))
            .cloned()
    }

    pub fn fix_hint(&self, code: &Code) -> Option<String> {
        self.lock().fix_index.get(code).cloned()
    }

    /// Codes currently visible in the report: failures, then warnings.
    /// Suppressed warnings are not part of this list.
    pub fn codes_present(&self) -> Vec<Code> {
        let state = self.lock();
        let mut out = Vec::new();
        for status in [Status::Failure, Status::Warning] {
            for entry in state.entries.values().filter(|e| e.status() == status) {
                for issue in &entry.issues {
                    if !out.contains(&issue.code) {
                        out.push(issue.code.clone());
                    }
                }
            }
        }
        out
    }

    /// Codes worth handing to the remediation dispatcher, including warnings
    /// hidden by suppression.
    pub fn remediation_codes(&self) -> Vec<Code> {
        let mut out = self.codes_present();
        let state = self.lock();
        for code in state.suppressed.keys() {
            if !out.contains(code) {
                out.push(code.clone());
            }
        }
        out
    }

    pub fn host(&self) -> String {
        self.host
            .clone()
            .unwrap_or_else(crate::platform::hostname)
    }

    pub fn snapshot(&self) -> ReportDocument {
        let host = self.host();
        let state = self.lock();
        let mut doc = ReportDocument {
            host,
            success: Vec::new(),
            warnings: BTreeMap::new(),
            failures: BTreeMap::new(),
        };
        for (name, entry) in &state.entries {
            let bucket = match entry.status() {
                Status::Success => {
                    doc.success.push(name.clone());
                    continue;
                }
                Status::Warning => &mut doc.warnings,
                Status::Failure => &mut doc.failures,
            };
            for issue in &entry.issues {
                bucket.insert(
                    issue.code.to_string(),
                    (name.clone(), issue.message.clone()),
                );
            }
        }
        doc
    }

    pub fn render_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }

    pub fn render(&self) -> String {
        self.render_with(false)
    }

    pub fn render_with(&self, color: bool) -> String {
        let host = self.host();
        let state = self.lock();

        let longest = state
            .entries
            .values()
            .flat_map(|e| e.issues.iter())
            .map(|i| unicode_width::UnicodeWidthStr::width(i.formatted_issue().as_str()))
            .max()
            .unwrap_or(DEFAULT_REASON_WIDTH);

        let mut rows: Vec<Vec<String>> = Vec::new();
        for status in [Status::Failure, Status::Warning, Status::Success] {
            for (name, entry) in state.entries.iter().filter(|(_, e)| e.status() == status) {
                let mut reasons = Vec::new();
                for issue in &entry.issues {
                    reasons.push(issue.formatted_issue());
                    if let Some(fix) = issue.formatted_fix() {
                        if state.wrap {
                            reasons.push(crate::ui::wrap_text(&fix, longest));
                        } else {
                            reasons.push(fix);
                        }
                    }
                }
                let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
                rows.push(vec![
                    name.clone(),
                    crate::ui::format_status(status, color),
                    reasons.join("\n"),
                    tags.join("\n"),
                ]);
            }
        }

        let table = crate::ui::render_grid(&["Test", "Status", "Reasons", "Tags"], &rows);
        format!("HOST: {host}\n{table}")
    }
}

impl ReportState {
    fn push_issue(
        &mut self,
        name: &str,
        tags: &[String],
        severity: Severity,
        code: Code,
        message: &str,
        fix_hint: Option<&str>,
    ) {
        self.code_index
            .insert(code.clone(), (name.to_string(), message.to_string()));
        if let Some(fix) = fix_hint {
            self.fix_index.insert(code.clone(), fix.to_string());
        }
        let entry = self.entries.entry(name.to_string()).or_default();
        entry.tags.extend(tags.iter().cloned());
        entry.issues.push(Issue {
            severity,
            code,
            message: message.to_string(),
            fix_hint: fix_hint.map(ToOwned::to_owned),
        });
    }
}
