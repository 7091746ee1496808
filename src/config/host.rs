use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::{Map, Value};

pub const DEFAULT_HOST_CONFIG_FILE: &str = ".ddct.json";
pub const GENERATED_HOST_CONFIG_FILE: &str = "ddct.json";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_\-]+)\}").expect("valid regex literal"));

pub trait StorageApi: Send + Sync {
    fn system(&self) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct ConfigApi {
    system: Value,
}

impl ConfigApi {
    pub fn new(system: Value) -> Self {
        Self { system }
    }
}

impl StorageApi for ConfigApi {
    fn system(&self) -> Result<Value> {
        Ok(self.system.clone())
    }
}

#[derive(Clone, Default)]
pub struct HostConfig {
    values: Map<String, Value>,
    api: Option<Arc<dyn StorageApi>>,
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&String> = self.values.keys().collect();
        f.debug_struct("HostConfig")
            .field("keys", &keys)
            .field("api", &self.api.is_some())
            .finish()
    }
}

impl HostConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(values) = value else {
            return Err(anyhow!("host configuration must be a JSON object"));
        };
        let api = values
            .get("cluster")
            .cloned()
            .map(|system| Arc::new(ConfigApi::new(system)) as Arc<dyn StorageApi>);
        Ok(Self { values, api })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let value: Value = serde_json::from_str(&s)
            .with_context(|| format!("failed to parse config file (JSON): {}", path.display()))?;
        Self::from_value(value)
    }

    pub fn with_api(mut self, api: Arc<dyn StorageApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn api(&self) -> Option<&dyn StorageApi> {
        self.api.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn mgmt_ip(&self) -> Option<&str> {
        self.get_str("mgmt_ip")
    }

    pub fn vip1_ip(&self) -> Option<&str> {
        self.get_str("vip1_ip")
    }

    pub fn vip2_ip(&self) -> Option<&str> {
        self.get_str("vip2_ip")
    }

    pub fn expand(&self, template: &str) -> Result<String> {
        let mut missing = Vec::new();
        let out = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match self.values.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    missing.push(key.to_string());
                    String::new()
                }
                Some(other) => other.to_string(),
            }
        });
        if !missing.is_empty() {
            return Err(anyhow!(
                "config is missing value(s) for placeholder(s): {}",
                missing.join(", ")
            ));
        }
        Ok(out.into_owned())
    }

    pub fn sample() -> Value {
        serde_json::json!({
            "mgmt_ip": "1.1.1.1",
            "vip1_ip": "10.0.1.1",
            "vip2_ip": "10.0.2.1",
            "username": "admin",
            "password": "password",
            "cluster": {
                "l3_enabled": false,
                "callhome_enabled": true,
                "mgmt_mtu": 1500,
                "access_mtu": 9000
            }
        })
    }
}

/// `--config-file`, then `DDCT_CONFIG_FILE`, then `./.ddct.json`.
pub fn resolve_host_config_path(
    explicit: Option<&Path>,
    env: Option<&Path>,
    cwd: &Path,
) -> Option<PathBuf> {
    if let Some(p) = explicit.or(env) {
        return Some(p.to_path_buf());
    }
    let default = cwd.join(DEFAULT_HOST_CONFIG_FILE);
    default.exists().then_some(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(HostConfig::from_value(serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn cluster_section_becomes_api() {
        let cfg = HostConfig::from_value(HostConfig::sample()).expect("config");
        let api = cfg.api().expect("api");
        let system = api.system().expect("system");
        assert_eq!(system["access_mtu"], 9000);
        assert_eq!(cfg.mgmt_ip(), Some("1.1.1.1"));
    }

    #[test]
    fn expand_substitutes_and_reports_missing_keys() {
        let cfg = HostConfig::from_value(serde_json::json!({"mgmt_ip": "1.2.3.4", "port": 3260}))
            .expect("config");
        assert_eq!(
            cfg.expand("ping {mgmt_ip}:{port}").expect("expand"),
            "ping 1.2.3.4:3260"
        );
        let err = cfg.expand("ping {vip9_ip}").expect_err("missing");
        assert!(err.to_string().contains("vip9_ip"), "{err}");
    }

    #[test]
    fn blank_strings_read_as_absent() {
        let cfg = HostConfig::from_value(serde_json::json!({"vip2_ip": "  "})).expect("config");
        assert_eq!(cfg.vip2_ip(), None);
    }
}
