use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// 主动探测间隔
    pub probe_interval_ms: u64,
    /// 单次探测超时
    pub probe_timeout_ms: u64,
    /// 连续失败多少次标记为 Unhealthy
    pub failure_threshold: u32,
    /// Unhealthy 实例恢复探测的最大退避间隔
    pub max_recovery_interval_ms: u64,
}

impl HealthCheckConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn max_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.max_recovery_interval_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            max_recovery_interval_ms: 60_000,
        }
    }
}

/// 单次健康检查结果，仅在健康检查器内部流转
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub instance_id: String,
    pub success: bool,
    pub latency: Duration,
    /// 探测开始时间，用于后写者胜的判定
    pub timestamp: Instant,
    pub error: Option<String>,
}

// 每个实例的探测计划
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProbeSchedule {
    pub next_probe_at: Instant,
    pub backoff: Duration,
}
