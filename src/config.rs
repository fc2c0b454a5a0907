use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::services::client::DiscoveryConfig;
use crate::services::error::DiscoveryError;

const CONFIG_PATH_VAR: &str = "DISCOVERY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";
const ENV_PREFIX: &str = "DISCOVERY_";

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to read environment overrides: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    /// RUST_LOG 未设置时使用的过滤规则
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:50051".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

// DISCOVERY_ 前缀的扁平环境变量覆盖
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    listen_address: Option<String>,
    log_filter: Option<String>,
    ttl_ms: Option<u64>,
    ttl_check_interval_ms: Option<u64>,
    probe_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    volume_threshold: Option<usize>,
    failure_rate_threshold: Option<f64>,
    cooldown_base_ms: Option<u64>,
    default_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
}

impl Config {
    /// 加载配置：配置文件 -> .env -> 环境变量覆盖 -> 校验
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "Failed to load .env file");
            }
        }

        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env(envy::prefixed(ENV_PREFIX).from_env::<EnvOverrides>()?);
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件读取，文件不存在时使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self, env: EnvOverrides) {
        let discovery = &mut self.discovery;
        if let Some(v) = env.listen_address {
            self.server.listen_address = v;
        }
        if let Some(v) = env.log_filter {
            self.server.log_filter = v;
        }
        if let Some(v) = env.ttl_ms {
            discovery.registry.ttl_ms = v;
        }
        if let Some(v) = env.ttl_check_interval_ms {
            discovery.registry.ttl_check_interval_ms = v;
        }
        if let Some(v) = env.probe_interval_ms {
            discovery.health.probe_interval_ms = v;
        }
        if let Some(v) = env.probe_timeout_ms {
            discovery.health.probe_timeout_ms = v;
        }
        if let Some(v) = env.failure_threshold {
            discovery.health.failure_threshold = v;
        }
        if let Some(v) = env.volume_threshold {
            discovery.circuit_breaker.volume_threshold = v;
        }
        if let Some(v) = env.failure_rate_threshold {
            discovery.circuit_breaker.failure_rate_threshold = v;
        }
        if let Some(v) = env.cooldown_base_ms {
            discovery.circuit_breaker.cooldown_base_ms = v;
        }
        if let Some(v) = env.default_timeout_ms {
            discovery.client.default_timeout_ms = v;
        }
        if let Some(v) = env.max_retries {
            discovery.client.max_retries = v;
        }
    }

    /// 校验服务发现配置和监听地址
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.discovery.validate().map_err(|e| match e {
            DiscoveryError::Config(message) => ConfigError::Invalid(message),
            other => ConfigError::Invalid(other.to_string()),
        })?;

        if self.server.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.listen_address is not a socket address: {}",
                self.server.listen_address
            )));
        }
        Ok(())
    }
}
