use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use evaluator::{DEFAULT_CAPTURE_LIMIT, DEFAULT_REQUEST_TIMEOUT, EnvironmentOptions};
use sandbox::{NetworkPolicy, ResourceLimits};
use sandbox_docker::DockerConfig;
use serde::Deserialize;

use crate::error::{EvaldError, EvaldResult};

pub(crate) const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_STOP_GRACE_SECS: u64 = 5;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_PYTHON_IMAGE: &str = "euank/python:3.6";

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaldConfig {
    pub listen: String,
    pub request_timeout_secs: u64,
    pub max_concurrent: usize,
    /// Per-stream capture limit; `null` captures without bound.
    pub capture_limit_bytes: Option<usize>,
    pub stop_grace_secs: u64,
    pub max_body_bytes: usize,
    pub docker: DockerSection,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Default for EvaldConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        environments.insert(
            "python".to_string(),
            EnvironmentConfig {
                image: DEFAULT_PYTHON_IMAGE.to_string(),
                aliases: vec!["py".to_string()],
                limits: LimitsConfig::default(),
            },
        );
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            capture_limit_bytes: Some(DEFAULT_CAPTURE_LIMIT),
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            docker: DockerSection::default(),
            environments,
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSection {
    pub host: Option<String>,
    pub timeout_secs: u64,
    pub remove_on_stop: bool,
}

impl Default for DockerSection {
    fn default() -> Self {
        let defaults = DockerConfig::default();
        Self {
            host: defaults.host,
            timeout_secs: defaults.timeout_secs,
            remove_on_stop: defaults.remove_on_stop,
        }
    }
}

impl From<&DockerSection> for DockerConfig {
    fn from(section: &DockerSection) -> Self {
        Self {
            host: section.host.clone(),
            timeout_secs: section.timeout_secs,
            remove_on_stop: section.remove_on_stop,
        }
    }
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub image: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub memory_mb: u32,
    pub cpu_percent: u32,
    pub pids_limit: u32,
    pub network: NetworkConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = ResourceLimits::default();
        Self {
            memory_mb: defaults.memory_mb,
            cpu_percent: defaults.cpu_percent,
            pids_limit: defaults.pids_limit,
            network: NetworkConfig::default(),
        }
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            memory_mb: limits.memory_mb,
            cpu_percent: limits.cpu_percent,
            pids_limit: limits.pids_limit,
            network: match limits.network.mode {
                NetworkMode::None => NetworkPolicy::None,
                NetworkMode::RestrictedDns => NetworkPolicy::RestrictedDns {
                    servers: limits.network.dns.clone(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    None,
    RestrictedDns,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub dns: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        match NetworkPolicy::default() {
            NetworkPolicy::RestrictedDns { servers } => Self {
                mode: NetworkMode::RestrictedDns,
                dns: servers,
            },
            NetworkPolicy::None => Self {
                mode: NetworkMode::None,
                dns: Vec::new(),
            },
        }
    }
}

/// Load and validate a config from a YAML file.
pub async fn load(path: &Path) -> EvaldResult<EvaldConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EvaldError::Config(format!("read {}: {e}", path.display())))?;
    let config: EvaldConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| EvaldError::Config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Load `path` when given, otherwise fall back to the built-in defaults.
pub async fn load_or_default(path: Option<&Path>) -> EvaldResult<EvaldConfig> {
    match path {
        Some(path) => load(path).await,
        None => Ok(EvaldConfig::default()),
    }
}

impl EvaldConfig {
    pub fn validate(&self) -> EvaldResult<()> {
        self.listen_addr()?;
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be positive"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent must be positive"));
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("max_body_bytes must be positive"));
        }
        if self.environments.is_empty() {
            return Err(invalid("at least one environment is required"));
        }

        let mut names: HashSet<&str> = self.environments.keys().map(String::as_str).collect();
        for (name, env) in &self.environments {
            if env.image.trim().is_empty() {
                return Err(invalid(&format!("environment {name}: image is empty")));
            }
            let limits = &env.limits;
            if limits.memory_mb == 0 || limits.cpu_percent == 0 || limits.pids_limit == 0 {
                return Err(invalid(&format!(
                    "environment {name}: memory_mb, cpu_percent and pids_limit must be positive"
                )));
            }
            if limits.network.mode == NetworkMode::RestrictedDns && limits.network.dns.is_empty() {
                return Err(invalid(&format!(
                    "environment {name}: restricted_dns needs at least one dns server"
                )));
            }
            for alias in &env.aliases {
                if !names.insert(alias.as_str()) {
                    return Err(invalid(&format!(
                        "environment {name}: alias {alias} is already taken"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> EvaldResult<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| invalid(&format!("listen {}: {e}", self.listen)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn environment_options(&self) -> EnvironmentOptions {
        EnvironmentOptions {
            capture_limit: self.capture_limit_bytes,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            ..EnvironmentOptions::default()
        }
    }

    /// Every distinct image the configured environments use.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .environments
            .values()
            .map(|env| env.image.clone())
            .collect();
        images.sort_unstable();
        images.dedup();
        images
    }
}

fn invalid(msg: &str) -> EvaldError {
    EvaldError::Config(msg.to_string())
}
