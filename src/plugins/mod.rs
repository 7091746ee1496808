use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Result, anyhow};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::HostConfig;
use crate::fixes::FixRegistry;
use crate::platform;
use crate::rules::Rule;

mod manifest;

pub use manifest::{CheckManifest, FixManifest, InstallManifest};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

static PLUGIN_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(check|fix|install)_(.+)\.toml$").expect("valid regex literal")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginKind {
    Check,
    Fix,
    Install,
}

impl PluginKind {
    pub const ALL: [PluginKind; 3] = [PluginKind::Check, PluginKind::Fix, PluginKind::Install];

    pub const fn prefix(self) -> &'static str {
        match self {
            PluginKind::Check => "check",
            PluginKind::Fix => "fix",
            PluginKind::Install => "install",
        }
    }

    pub const fn title(self) -> &'static str {
        match self {
            PluginKind::Check => "Check Plugins",
            PluginKind::Fix => "Fix Plugins",
            PluginKind::Install => "Install Plugins",
        }
    }

    fn from_prefix(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == s)
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unrecognized {kind} plugin requested: {name} (available {kind} plugins: {available})")]
    Unknown {
        kind: PluginKind,
        name: String,
        available: String,
    },
    #[error("invalid {kind} plugin `{name}`: {path}")]
    Manifest {
        kind: PluginKind,
        name: String,
        path: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to scan plugin directory: {path}")]
    Discovery {
        path: String,
        #[source]
        source: BoxError,
    },
}

type ChecksLoader = Arc<dyn Fn() -> Vec<Rule> + Send + Sync>;
type FixesLoader = Arc<dyn Fn() -> FixRegistry + Send + Sync>;
type InstallFn = Arc<dyn Fn(&HostConfig) -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum Source<T> {
    Manifest(PathBuf),
    Compiled(T),
}

impl<T> Source<T> {
    fn describe(&self) -> String {
        match self {
            Source::Manifest(path) => path.display().to_string(),
            Source::Compiled(_) => "(built in)".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Installer {
    name: String,
    description: String,
    body: InstallBody,
}

#[derive(Clone)]
enum InstallBody {
    Steps {
        requires: Vec<String>,
        steps: Vec<String>,
    },
    Compiled(InstallFn),
}

impl fmt::Debug for Installer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl Installer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn run(&self, config: &HostConfig) -> Result<()> {
        match &self.body {
            InstallBody::Compiled(f) => f(config),
            InstallBody::Steps { requires, steps } => {
                let missing: Vec<&str> = requires
                    .iter()
                    .map(String::as_str)
                    .filter(|bin| !platform::binary_available(bin))
                    .collect();
                if !missing.is_empty() {
                    return Err(anyhow!(
                        "installer `{}` is missing requirement(s): {}",
                        self.name,
                        missing.join(", ")
                    ));
                }
                manifest::run_steps(steps, config)
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct PluginCatalog {
    checks: BTreeMap<String, Source<ChecksLoader>>,
    fixes: BTreeMap<String, Source<FixesLoader>>,
    installers: BTreeMap<String, Source<InstallFn>>,
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .field("fixes", &self.fixes.keys().collect::<Vec<_>>())
            .field("installers", &self.installers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discover(dir: &Path) -> Result<Self, PluginError> {
        let mut catalog = Self::new();
        for (kind, name, path) in scan_dir(dir)? {
            tracing::debug!(%kind, %name, path = %path.display(), "plugin discovered");
            match kind {
                PluginKind::Check => {
                    catalog.checks.insert(name, Source::Manifest(path));
                }
                PluginKind::Fix => {
                    catalog.fixes.insert(name, Source::Manifest(path));
                }
                PluginKind::Install => {
                    catalog.installers.insert(name, Source::Manifest(path));
                }
            }
        }
        Ok(catalog)
    }

    pub fn register_checks<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn() -> Vec<Rule> + Send + Sync + 'static,
    {
        self.checks
            .insert(name.into(), Source::Compiled(Arc::new(loader)));
    }

    pub fn register_fixes<F>(&mut self, name: impl Into<String>, loader: F)
    where
        F: Fn() -> FixRegistry + Send + Sync + 'static,
    {
        self.fixes
            .insert(name.into(), Source::Compiled(Arc::new(loader)));
    }

    pub fn register_installer<F>(&mut self, name: impl Into<String>, install: F)
    where
        F: Fn(&HostConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.installers
            .insert(name.into(), Source::Compiled(Arc::new(install)));
    }

    pub fn names(&self, kind: PluginKind) -> Vec<String> {
        match kind {
            PluginKind::Check => self.checks.keys().cloned().collect(),
            PluginKind::Fix => self.fixes.keys().cloned().collect(),
            PluginKind::Install => self.installers.keys().cloned().collect(),
        }
    }

    pub fn listing(&self, kind: PluginKind) -> Vec<(String, String)> {
        fn rows<T>(map: &BTreeMap<String, Source<T>>) -> Vec<(String, String)> {
            map.iter().map(|(n, s)| (n.clone(), s.describe())).collect()
        }
        match kind {
            PluginKind::Check => rows(&self.checks),
            PluginKind::Fix => rows(&self.fixes),
            PluginKind::Install => rows(&self.installers),
        }
    }

    fn ensure_known<T>(
        kind: PluginKind,
        map: &BTreeMap<String, Source<T>>,
        names: &[String],
    ) -> Result<(), PluginError> {
        for name in names {
            if !map.contains_key(name) {
                let available: Vec<&str> = map.keys().map(String::as_str).collect();
                return Err(PluginError::Unknown {
                    kind,
                    name: name.clone(),
                    available: if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    },
                });
            }
        }
        Ok(())
    }

    /// Every name must resolve before anything is loaded.
    pub fn load_checks_for(&self, names: &[String]) -> Result<Vec<Rule>, PluginError> {
        Self::ensure_known(PluginKind::Check, &self.checks, names)?;
        let mut rules = Vec::new();
        for name in names {
            match &self.checks[name] {
                Source::Compiled(loader) => rules.extend(loader()),
                Source::Manifest(path) => {
                    let manifest = CheckManifest::load(path)
                        .map_err(|e| manifest_error(PluginKind::Check, name, path, e))?;
                    rules.extend(manifest.into_rules());
                }
            }
        }
        Ok(rules)
    }

    pub fn load_fixes_for(&self, names: &[String]) -> Result<FixRegistry, PluginError> {
        Self::ensure_known(PluginKind::Fix, &self.fixes, names)?;
        let mut registry = FixRegistry::new();
        for name in names {
            match &self.fixes[name] {
                Source::Compiled(loader) => registry.merge(loader()),
                Source::Manifest(path) => {
                    let manifest = FixManifest::load(path)
                        .map_err(|e| manifest_error(PluginKind::Fix, name, path, e))?;
                    registry.merge(manifest.into_registry());
                }
            }
        }
        Ok(registry)
    }

    pub fn load_installers_for(&self, names: &[String]) -> Result<Vec<Installer>, PluginError> {
        Self::ensure_known(PluginKind::Install, &self.installers, names)?;
        let mut out = Vec::new();
        for name in names {
            let installer = match &self.installers[name] {
                Source::Compiled(f) => Installer {
                    name: name.clone(),
                    description: String::new(),
                    body: InstallBody::Compiled(Arc::clone(f)),
                },
                Source::Manifest(path) => {
                    let m = InstallManifest::load(path)
                        .map_err(|e| manifest_error(PluginKind::Install, name, path, e))?;
                    Installer {
                        name: name.clone(),
                        description: m.description,
                        body: InstallBody::Steps {
                            requires: m.requires,
                            steps: m.steps,
                        },
                    }
                }
            };
            out.push(installer);
        }
        Ok(out)
    }
}

fn manifest_error(kind: PluginKind, name: &str, path: &Path, err: anyhow::Error) -> PluginError {
    PluginError::Manifest {
        kind,
        name: name.to_string(),
        path: path.display().to_string(),
        source: err.into(),
    }
}

fn naming_globs() -> Result<GlobSet, PluginError> {
    let mut builder = GlobSetBuilder::new();
    for kind in PluginKind::ALL {
        let pat = format!("{}_*.toml", kind.prefix());
        let glob = Glob::new(&pat).map_err(|e| PluginError::Discovery {
            path: pat.clone(),
            source: e.into(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| PluginError::Discovery {
        path: "<naming globs>".to_string(),
        source: e.into(),
    })
}

pub fn scan_dir(dir: &Path) -> Result<Vec<(PluginKind, String, PathBuf)>, PluginError> {
    if !dir.is_dir() {
        tracing::debug!(dir = %dir.display(), "plugin directory does not exist");
        return Ok(Vec::new());
    }
    let globs = naming_globs()?;
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| PluginError::Discovery {
            path: dir.display().to_string(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !globs.is_match(file_name.as_ref()) {
            continue;
        }
        let Some(caps) = PLUGIN_NAME_RE.captures(&file_name) else {
            continue;
        };
        let Some(kind) = PluginKind::from_prefix(&caps[1]) else {
            continue;
        };
        out.push((kind, caps[2].to_string(), entry.path().to_path_buf()));
    }
    Ok(out)
}
