use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Codes are the public contract between checks and fixes: once published a
/// code keeps its meaning forever.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(String);

pub const MAX_CODE_LEN: usize = 8;

pub const RULE_ERROR: &str = "E0000001";

impl Code {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_CODE_LEN
            && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Code {
    fn from(s: &str) -> Self {
        Code::new(s)
    }
}

impl From<String> for Code {
    fn from(s: String) -> Self {
        Code::new(s)
    }
}

impl FromStr for Code {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = Code::new(s);
        if !code.is_well_formed() {
            return Err(format!(
                "invalid code: {s} (expected 1-{MAX_CODE_LEN} hexadecimal characters)"
            ));
        }
        Ok(code)
    }
}

impl AsRef<str> for Code {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
