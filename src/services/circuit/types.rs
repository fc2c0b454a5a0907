use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 滑动窗口大小（按调用次数）
    pub window_size: usize,
    /// 窗口内至少有这么多次调用才会判断失败率
    pub volume_threshold: usize,
    /// 失败率达到该值时熔断
    pub failure_rate_threshold: f64,
    /// 初始冷却时间
    pub cooldown_base_ms: u64,
    /// 冷却时间上限
    pub cooldown_max_ms: u64,
    /// 半开探测失败后冷却时间的放大倍数
    pub backoff_factor: f64,
}

impl CircuitBreakerConfig {
    pub fn cooldown_base(&self) -> Duration {
        Duration::from_millis(self.cooldown_base_ms)
    }

    pub fn cooldown_max(&self) -> Duration {
        Duration::from_millis(self.cooldown_max_ms)
    }

    /// 下一次冷却时间：min(cooldown * backoff_factor, cooldown_max)
    pub fn next_cooldown(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_factor.max(1.0))
            .min(self.cooldown_max())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            volume_threshold: 10,
            failure_rate_threshold: 0.5,
            cooldown_base_ms: 5_000,
            cooldown_max_ms: 60_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

// 熔断目标：(服务名, 实例ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub service_name: String,
    pub instance_id: String,
}

impl CircuitKey {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// 熔断统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub total_calls: u64,
    pub total_failures: u64,
    /// 被快速失败拒绝的调用
    pub rejected_calls: u64,
    pub times_opened: u64,
}

/// 某个目标熔断状态的只读快照
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub window_calls: usize,
    pub window_failures: usize,
    pub cooldown: Duration,
    /// Open 状态下距离允许半开探测的剩余时间
    pub retry_after: Option<Duration>,
    pub probe_in_flight: bool,
    pub stats: CircuitStats,
}

impl CircuitSnapshot {
    pub fn failure_rate(&self) -> f64 {
        if self.window_calls == 0 {
            0.0
        } else {
            self.window_failures as f64 / self.window_calls as f64
        }
    }
}
