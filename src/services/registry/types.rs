use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// 实例健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// 实例元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetadata {
    pub version: String,
    pub tags: Vec<String>,
    /// 加权随机策略使用的权重，0 表示不参与加权选择
    pub weight: u32,
    pub labels: HashMap<String, String>,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            version: String::new(),
            tags: Vec::new(),
            weight: 1,
            labels: HashMap::new(),
        }
    }
}

/// register() 的输入
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub address: String,
    pub metadata: InstanceMetadata,
    pub health_endpoint: Option<String>,
    /// 为空时使用注册中心的默认 TTL
    pub ttl: Option<Duration>,
}

impl ServiceRegistration {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.metadata.weight = weight;
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

// 注册表中的服务实例，list() 返回的是它的拷贝
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub address: String,
    pub metadata: InstanceMetadata,
    pub health_endpoint: Option<String>,
    pub ttl: Duration,
    pub state: HealthState,
    pub last_heartbeat: Instant,
    pub registered_at: Instant,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<Instant>,
}

impl ServiceInstance {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > self.ttl
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub(crate) fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// 一次健康信号应用后的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub previous: HealthState,
    pub current: HealthState,
    pub consecutive_failures: u32,
    /// 信号早于上一次已应用的信号时被丢弃
    pub applied: bool,
}

impl HealthUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// 单个服务的健康汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceHealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// 注册中心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 默认实例 TTL
    pub ttl_ms: u64,
    /// 过期清理间隔
    pub ttl_check_interval_ms: u64,
    /// 建议客户端使用的心跳间隔
    pub heartbeat_interval_ms: u64,
    /// 事件广播通道容量
    pub event_channel_capacity: usize,
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn ttl_check_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_check_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            ttl_check_interval_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            event_channel_capacity: 1024,
        }
    }
}
