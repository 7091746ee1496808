use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

mod host;

pub use host::{
    ConfigApi, DEFAULT_HOST_CONFIG_FILE, GENERATED_HOST_CONFIG_FILE, HostConfig, StorageApi,
    resolve_host_config_path,
};

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub ui: UiConfig,
    pub report: ReportConfig,
    pub engine: EngineConfig,
    pub paths: PathsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    pub warnings: bool,
    pub wrap: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathsConfig {
    pub plugin_dir: PathBuf,
    pub state_file: PathBuf,
}

impl EffectiveConfig {
    pub fn defaults_for(home_dir: &Path) -> Self {
        let base = config_dir(home_dir);
        Self {
            ui: UiConfig { color: true },
            report: ReportConfig {
                warnings: true,
                wrap: true,
            },
            engine: EngineConfig { max_workers: 0 },
            paths: PathsConfig {
                plugin_dir: base.join("plugins"),
                state_file: base.join("state.json"),
            },
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    ui: Option<RawUiConfig>,
    report: Option<RawReportConfig>,
    engine: Option<RawEngineConfig>,
    paths: Option<RawPathsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawReportConfig {
    warnings: Option<bool>,
    wrap: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    max_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawPathsConfig {
    plugin_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
}

pub fn config_dir(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/ddct")
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    config_dir(home_dir).join("config.toml")
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::defaults_for(home_dir);

    let path = config_path
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| default_config_path(home_dir));

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s).context("failed to parse settings file (TOML)")?;
        apply_raw_config(&mut cfg, raw, home_dir);
        cfg.config_path = Some(path.display().to_string());
    }

    apply_env_overrides(&mut cfg, home_dir)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig, home_dir: &Path) {
    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }

    if let Some(report) = raw.report {
        if let Some(warnings) = report.warnings {
            cfg.report.warnings = warnings;
        }
        if let Some(wrap) = report.wrap {
            cfg.report.wrap = wrap;
        }
    }

    if let Some(engine) = raw.engine {
        if let Some(max_workers) = engine.max_workers {
            cfg.engine.max_workers = max_workers;
        }
    }

    if let Some(paths) = raw.paths {
        if let Some(plugin_dir) = paths.plugin_dir {
            cfg.paths.plugin_dir = expand_tilde(&plugin_dir, home_dir);
        }
        if let Some(state_file) = paths.state_file {
            cfg.paths.state_file = expand_tilde(&state_file, home_dir);
        }
    }
}

fn apply_env_overrides(cfg: &mut EffectiveConfig, home_dir: &Path) -> Result<()> {
    if let Ok(v) = std::env::var("DDCT_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "DDCT_UI_COLOR")?;
    }
    if let Ok(v) = std::env::var("DDCT_REPORT_WARNINGS") {
        cfg.report.warnings = parse_bool(&v).with_context(|| "DDCT_REPORT_WARNINGS")?;
    }
    if let Ok(v) = std::env::var("DDCT_REPORT_WRAP") {
        cfg.report.wrap = parse_bool(&v).with_context(|| "DDCT_REPORT_WRAP")?;
    }
    if let Ok(v) = std::env::var("DDCT_MAX_WORKERS") {
        cfg.engine.max_workers = v
            .trim()
            .parse::<usize>()
            .with_context(|| "DDCT_MAX_WORKERS")?;
    }
    if let Ok(v) = std::env::var("DDCT_PLUGIN_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.paths.plugin_dir = expand_tilde(Path::new(v), home_dir);
        }
    }
    if let Ok(v) = std::env::var("DDCT_STATE_FILE") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.paths.state_file = expand_tilde(Path::new(v), home_dir);
        }
    }

    Ok(())
}

fn expand_tilde(path: &Path, home_dir: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "invalid boolean: {s} (use true|false|1|0|yes|no|on|off)"
        )),
    }
}
