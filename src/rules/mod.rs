use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::config::HostConfig;
use crate::core::{Code, Finding, Report};

pub mod local;
pub mod multipath;
pub mod network;

pub type RuleBody = dyn Fn(&RuleContext<'_>) -> Result<()> + Send + Sync;

#[derive(Clone)]
pub struct Rule {
    name: String,
    tags: Vec<String>,
    body: Arc<RuleBody>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .finish()
    }
}

impl Rule {
    pub fn new<F>(name: impl Into<String>, tags: &[&str], body: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let mut ordered: Vec<String> = Vec::with_capacity(tags.len());
        for tag in tags {
            let tag = tag.trim();
            if !tag.is_empty() && !ordered.iter().any(|t| t == tag) {
                ordered.push(tag.to_string());
            }
        }
        Self {
            name: name.into(),
            tags: ordered,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }

    pub fn invoke(&self, config: &HostConfig, report: &Report) -> Result<()> {
        let ctx = RuleContext {
            name: &self.name,
            tags: &self.tags,
            config,
            report,
        };
        (self.body)(&ctx)?;
        report.record_success(&self.name, &self.tags);
        Ok(())
    }
}

pub struct RuleContext<'a> {
    name: &'a str,
    tags: &'a [String],
    config: &'a HostConfig,
    report: &'a Report,
}

impl<'a> RuleContext<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn tags(&self) -> &[String] {
        self.tags
    }

    pub fn config(&self) -> &'a HostConfig {
        self.config
    }

    pub fn record(&self, finding: Finding) {
        self.report.record(self.name, self.tags, finding);
    }

    pub fn fail(&self, message: impl AsRef<str>, code: &str) {
        self.report
            .record_failure(self.name, message.as_ref(), Code::new(code), self.tags, None);
    }

    pub fn fail_with_fix(&self, message: impl AsRef<str>, code: &str, fix: impl AsRef<str>) {
        self.report.record_failure(
            self.name,
            message.as_ref(),
            Code::new(code),
            self.tags,
            Some(fix.as_ref()),
        );
    }

    pub fn warn(&self, message: impl AsRef<str>, code: &str) {
        self.report
            .record_warning(self.name, message.as_ref(), Code::new(code), self.tags, None);
    }

    pub fn warn_with_fix(&self, message: impl AsRef<str>, code: &str, fix: impl AsRef<str>) {
        self.report.record_warning(
            self.name,
            message.as_ref(),
            Code::new(code),
            self.tags,
            Some(fix.as_ref()),
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    /// Include first (any overlap keeps), then exclude (any overlap drops).
    pub fn accepts(&self, rule: &Rule) -> bool {
        if !self.include.is_empty() && !rule.has_any_tag(&self.include) {
            return false;
        }
        if !self.exclude.is_empty() && rule.has_any_tag(&self.exclude) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.extend(local::load_checks());
        set.extend(network::load_checks());
        set.extend(multipath::load_checks());
        set
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = Rule>) {
        self.rules.extend(rules);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn select(&self, filter: &TagFilter) -> Vec<&Rule> {
        self.rules.iter().filter(|r| filter.accepts(r)).collect()
    }

    pub fn tags(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|r| r.tags.iter().cloned())
            .collect()
    }
}

impl IntoIterator for RuleSet {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.into_iter()
    }
}
