use crate::core::Code;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Failure,
    Warning,
    Success,
}

impl Status {
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Warning => "WARN",
            Status::Failure => "FAIL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: Code,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
}

impl Issue {
    pub fn formatted_issue(&self) -> String {
        format!("ISSUE {}: {}", self.code, self.message)
    }

    pub fn formatted_fix(&self) -> Option<String> {
        self.fix_hint
            .as_deref()
            .map(|fix| format!("FIX {}: {fix}", self.code))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Success,
    Warning {
        message: String,
        code: Code,
        fix_hint: Option<String>,
    },
    Failure {
        message: String,
        code: Code,
        fix_hint: Option<String>,
    },
}

impl Finding {
    pub fn warning(message: impl Into<String>, code: impl Into<Code>) -> Self {
        Finding::Warning {
            message: message.into(),
            code: code.into(),
            fix_hint: None,
        }
    }

    pub fn failure(message: impl Into<String>, code: impl Into<Code>) -> Self {
        Finding::Failure {
            message: message.into(),
            code: code.into(),
            fix_hint: None,
        }
    }

    pub fn with_fix(self, hint: impl Into<String>) -> Self {
        match self {
            Finding::Success => Finding::Success,
            Finding::Warning { message, code, .. } => Finding::Warning {
                message,
                code,
                fix_hint: Some(hint.into()),
            },
            Finding::Failure { message, code, .. } => Finding::Failure {
                message,
                code,
                fix_hint: Some(hint.into()),
            },
        }
    }

    pub fn into_issue(self) -> Option<Issue> {
        match self {
            Finding::Success => None,
            Finding::Warning {
                message,
                code,
                fix_hint,
            } => Some(Issue {
                severity: Severity::Warning,
                code,
                message,
                fix_hint,
            }),
            Finding::Failure {
                message,
                code,
                fix_hint,
            } => Some(Issue {
                severity: Severity::Failure,
                code,
                message,
                fix_hint,
            }),
        }
    }
}
