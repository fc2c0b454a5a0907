use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::types::{CircuitBreakerConfig, CircuitKey, CircuitSnapshot, CircuitState, CircuitStats};
use crate::services::error::DiscoveryError;
use crate::services::outcome::CallOutcome;

// 单个目标的熔断状态，所有状态迁移都在同一把锁下完成
#[derive(Debug)]
struct TargetState {
    state: CircuitState,
    // true 表示失败
    window: VecDeque<bool>,
    window_failures: usize,
    open_until: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
    stats: CircuitStats,
}

impl TargetState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            window_failures: 0,
            open_until: None,
            cooldown: config.cooldown_base(),
            probe_in_flight: false,
            stats: CircuitStats::default(),
        }
    }

    // Open 冷却到期后自动进入 HalfOpen
    fn refresh(&mut self, key: &CircuitKey, now: Instant) {
        if self.state == CircuitState::Open && self.open_until.is_some_and(|until| now >= until) {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
            tracing::info!(
                service_name = %key.service_name,
                instance_id = %key.instance_id,
                "Circuit cooldown elapsed, entering half-open"
            );
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.window_failures = 0;
    }

    fn push_outcome(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
        while self.window.len() > window_size.max(1) {
            if self.window.pop_front() == Some(true) {
                self.window_failures -= 1;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_failures as f64 / self.window.len() as f64
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.cooldown = cooldown;
        self.open_until = Some(now + cooldown);
        self.probe_in_flight = false;
        self.stats.times_opened += 1;
        self.clear_window();
    }

    fn close(&mut self, config: &CircuitBreakerConfig) {
        self.state = CircuitState::Closed;
        self.cooldown = config.cooldown_base();
        self.open_until = None;
        self.probe_in_flight = false;
        self.clear_window();
    }
}

fn lock(target: &Mutex<TargetState>) -> MutexGuard<'_, TargetState> {
    target.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Normal,
    // 半开状态下唯一的试探调用
    Probe,
}

/// 调用许可
///
/// 调用完成后必须通过 `record` 上报结果；半开探测许可在未上报就被丢弃时
/// 会释放探测名额，避免目标永远卡在半开状态。
#[derive(Debug)]
pub struct CallPermit {
    key: CircuitKey,
    kind: PermitKind,
    target: Arc<Mutex<TargetState>>,
    config: Arc<CircuitBreakerConfig>,
    completed: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.kind == PermitKind::Probe
    }

    pub fn key(&self) -> &CircuitKey {
        &self.key
    }

    /// 上报调用结果，并按结果驱动状态迁移
    pub fn record(mut self, outcome: CallOutcome) -> CircuitState {
        self.completed = true;
        let failed = !outcome.is_success();
        let now = Instant::now();
        let mut target = lock(&self.target);

        target.stats.total_calls += 1;
        if failed {
            target.stats.total_failures += 1;
        }

        match self.kind {
            PermitKind::Probe => {
                // 探测期间被 reset 过，结果作废
                if target.state != CircuitState::HalfOpen || !target.probe_in_flight {
                    return target.state;
                }
                if failed {
                    let cooldown = self.config.next_cooldown(target.cooldown);
                    target.open(now, cooldown);
                    tracing::warn!(
                        service_name = %self.key.service_name,
                        instance_id = %self.key.instance_id,
                        outcome = %outcome,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Half-open probe failed, circuit reopened"
                    );
                } else {
                    target.close(&self.config);
                    tracing::info!(
                        service_name = %self.key.service_name,
                        instance_id = %self.key.instance_id,
                        "Half-open probe succeeded, circuit closed"
                    );
                }
            }
            PermitKind::Normal => {
                // 熔断前已放行的调用只计入统计
                if target.state != CircuitState::Closed {
                    return target.state;
                }
                target.push_outcome(failed, self.config.window_size);

                let calls = target.window.len();
                let failure_rate = target.failure_rate();
                if calls >= self.config.volume_threshold
                    && failure_rate >= self.config.failure_rate_threshold
                {
                    let cooldown = target.cooldown;
                    target.open(now, cooldown);
                    tracing::warn!(
                        service_name = %self.key.service_name,
                        instance_id = %self.key.instance_id,
                        window_calls = calls,
                        failure_rate = failure_rate,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Failure rate exceeded threshold, circuit opened"
                    );
                }
            }
        }

        target.state
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.completed || self.kind != PermitKind::Probe {
            return;
        }
        let mut target = lock(&self.target);
        if target.state == CircuitState::HalfOpen && target.probe_in_flight {
            target.probe_in_flight = false;
            tracing::debug!(
                service_name = %self.key.service_name,
                instance_id = %self.key.instance_id,
                "Half-open probe abandoned, releasing probe slot"
            );
        }
    }
}

/// 按 (服务名, 实例ID) 维护的熔断器集合
#[derive(Debug)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    targets: DashMap<CircuitKey, Arc<Mutex<TargetState>>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            targets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // 首次调用时惰性创建
    fn target(&self, key: &CircuitKey) -> Arc<Mutex<TargetState>> {
        if let Some(target) = self.targets.get(key) {
            return target.value().clone();
        }
        self.targets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TargetState::new(&self.config))))
            .value()
            .clone()
    }

    fn existing(&self, key: &CircuitKey) -> Option<Arc<Mutex<TargetState>>> {
        self.targets.get(key).map(|target| target.value().clone())
    }

    /// 申请调用许可，Open 或半开探测名额已被占用时立即返回 CircuitOpen
    pub fn try_acquire(
        &self,
        service_name: &str,
        instance_id: &str,
    ) -> Result<CallPermit, DiscoveryError> {
        let key = CircuitKey::new(service_name, instance_id);
        let target = self.target(&key);
        let kind = {
            let mut state = lock(&target);
            state.refresh(&key, Instant::now());
            match state.state {
                CircuitState::Closed => PermitKind::Normal,
                CircuitState::HalfOpen if !state.probe_in_flight => {
                    state.probe_in_flight = true;
                    tracing::debug!(
                        service_name = %service_name,
                        instance_id = %instance_id,
                        "Admitting half-open probe call"
                    );
                    PermitKind::Probe
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    state.stats.rejected_calls += 1;
                    return Err(DiscoveryError::CircuitOpen {
                        service_name: service_name.to_string(),
                        instance_id: instance_id.to_string(),
                    });
                }
            }
        };

        Ok(CallPermit {
            key,
            kind,
            target,
            config: self.config.clone(),
            completed: false,
        })
    }

    /// 目标当前是否可以被负载均衡选中（Closed，或可以发起半开探测）
    pub fn is_selectable(&self, service_name: &str, instance_id: &str) -> bool {
        let key = CircuitKey::new(service_name, instance_id);
        let Some(target) = self.existing(&key) else {
            return true;
        };
        let mut state = lock(&target);
        state.refresh(&key, Instant::now());
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !state.probe_in_flight,
            CircuitState::Open => false,
        }
    }

    pub fn state(&self, service_name: &str, instance_id: &str) -> CircuitState {
        self.snapshot(service_name, instance_id)
            .map(|snapshot| snapshot.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, service_name: &str, instance_id: &str) -> Option<CircuitSnapshot> {
        let key = CircuitKey::new(service_name, instance_id);
        let target = self.existing(&key)?;
        let now = Instant::now();
        let mut state = lock(&target);
        state.refresh(&key, now);

        Some(CircuitSnapshot {
            state: state.state,
            window_calls: state.window.len(),
            window_failures: state.window_failures,
            cooldown: state.cooldown,
            retry_after: match state.state {
                CircuitState::Open => state
                    .open_until
                    .map(|until| until.saturating_duration_since(now)),
                _ => None,
            },
            probe_in_flight: state.probe_in_flight,
            stats: state.stats,
        })
    }

    /// 手动复位单个目标
    pub fn reset(&self, service_name: &str, instance_id: &str) {
        let key = CircuitKey::new(service_name, instance_id);
        if let Some(target) = self.existing(&key) {
            lock(&target).close(&self.config);
            tracing::info!(
                service_name = %service_name,
                instance_id = %instance_id,
                "Circuit manually reset"
            );
        }
    }

    pub fn reset_all(&self) {
        for entry in self.targets.iter() {
            lock(entry.value()).close(&self.config);
        }
        tracing::info!(targets = self.targets.len(), "All circuits reset");
    }
}
