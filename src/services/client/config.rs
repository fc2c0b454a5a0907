use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::balancer::LoadBalancerConfig;
use crate::services::circuit::CircuitBreakerConfig;
use crate::services::error::DiscoveryError;
use crate::services::health::HealthCheckConfig;
use crate::services::registry::RegistryConfig;

/// 调用相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 调用方未指定超时时使用的单次调用超时
    pub default_timeout_ms: u64,
    /// 幂等调用的最大重试次数
    pub max_retries: u32,
    /// 重试退避基数
    pub retry_backoff_ms: u64,
    /// 重试退避上限
    pub max_retry_backoff_ms: u64,
}

impl ClientConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3_000,
            max_retries: 1,
            retry_backoff_ms: 50,
            max_retry_backoff_ms: 1_000,
        }
    }
}

/// 服务发现层完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub registry: RegistryConfig,
    pub health: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub client: ClientConfig,
}

impl DiscoveryConfig {
    /// 拒绝零超时/零间隔、越界的失败率和小于 1 的退避因子
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        let non_zero = [
            ("registry.ttl_ms", self.registry.ttl_ms),
            ("registry.ttl_check_interval_ms", self.registry.ttl_check_interval_ms),
            ("registry.heartbeat_interval_ms", self.registry.heartbeat_interval_ms),
            ("health.probe_interval_ms", self.health.probe_interval_ms),
            ("health.probe_timeout_ms", self.health.probe_timeout_ms),
            ("health.max_recovery_interval_ms", self.health.max_recovery_interval_ms),
            ("circuit_breaker.cooldown_base_ms", self.circuit_breaker.cooldown_base_ms),
            ("circuit_breaker.cooldown_max_ms", self.circuit_breaker.cooldown_max_ms),
            ("client.default_timeout_ms", self.client.default_timeout_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(invalid(format!("{name} must be greater than zero")));
        }

        if self.registry.event_channel_capacity == 0 {
            return Err(invalid("registry.event_channel_capacity must be greater than zero"));
        }
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold must be greater than zero"));
        }

        let cb = &self.circuit_breaker;
        if cb.window_size == 0 || cb.volume_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.window_size and volume_threshold must be greater than zero",
            ));
        }
        if cb.volume_threshold > cb.window_size {
            return Err(invalid(format!(
                "circuit_breaker.volume_threshold ({}) exceeds window_size ({})",
                cb.volume_threshold, cb.window_size
            )));
        }
        if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 1.0) {
            return Err(invalid(format!(
                "circuit_breaker.failure_rate_threshold must be in (0, 1], got {}",
                cb.failure_rate_threshold
            )));
        }
        if cb.backoff_factor.is_nan() || cb.backoff_factor < 1.0 {
            return Err(invalid(format!(
                "circuit_breaker.backoff_factor must be at least 1, got {}",
                cb.backoff_factor
            )));
        }
        if cb.cooldown_max_ms < cb.cooldown_base_ms {
            return Err(invalid(
                "circuit_breaker.cooldown_max_ms is smaller than cooldown_base_ms",
            ));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DiscoveryError {
    DiscoveryError::Config(message.into())
}

/// 注册客户端配置
#[derive(Debug, Clone)]
pub struct RegistrationClientConfig {
    /// 注册中心地址
    pub registry_address: String,
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 单次请求超时时间
    pub request_timeout: Duration,
    /// 心跳间隔，默认取注册中心的 `heartbeat_interval_ms`
    pub heartbeat_interval: Duration,
}

impl Default for RegistrationClientConfig {
    fn default() -> Self {
        Self {
            registry_address: "http://localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: RegistryConfig::default().heartbeat_interval(),
        }
    }
}
