use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::probe::HealthProbe;
use super::types::{HealthCheckConfig, HealthCheckResult, ProbeSchedule};
use crate::services::outcome::CallOutcome;
use crate::services::registry::{HealthState, HealthUpdate, Registry, ServiceInstance};

/// 健康检查器
///
/// 主动探测与被动调用结果共用同一个连续失败计数和阈值，
/// 状态本身保存在注册表中，这里只维护每个实例的探测计划。
#[derive(Debug)]
pub struct HealthChecker {
    registry: Arc<Registry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    schedules: DashMap<String, ProbeSchedule>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<Registry>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            schedules: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// 执行一轮探测：只探测到期的实例，返回本轮的检查结果
    pub async fn run_probe_round(&self) -> Vec<HealthCheckResult> {
        self.run_probe_round_at(Instant::now()).await
    }

    // 后台循环传入 tick 的计划时间作为本轮时刻
    async fn run_probe_round_at(&self, now: Instant) -> Vec<HealthCheckResult> {
        let mut live = HashSet::new();
        let mut due = Vec::new();

        for service_name in self.registry.services() {
            for instance in self.registry.list(&service_name) {
                let is_due = self
                    .schedules
                    .get(&instance.id)
                    .is_none_or(|schedule| schedule.next_probe_at <= now);
                live.insert(instance.id.clone());
                if is_due {
                    due.push(instance);
                }
            }
        }

        // 已注销或过期实例的探测计划一并清掉
        self.schedules.retain(|instance_id, _| live.contains(instance_id));

        if due.is_empty() {
            return Vec::new();
        }
        tracing::debug!(due_count = due.len(), "Probing instances");

        let results = join_all(due.iter().map(|instance| self.check_instance(instance))).await;
        for result in &results {
            if let Some(update) = self.apply_result(result) {
                self.reschedule(&result.instance_id, update.current, now);
            }
        }
        results
    }

    /// 对单个实例做一次检查
    ///
    /// 有健康端点的实例走探测器，受 `probe_timeout` 约束；
    /// 没有端点的实例以心跳是否在 TTL 内作为检查结果。
    pub async fn check_instance(&self, instance: &ServiceInstance) -> HealthCheckResult {
        let timestamp = Instant::now();
        let outcome = if instance.health_endpoint.is_some() {
            let timeout = self.config.probe_timeout();
            match tokio::time::timeout(timeout, self.probe.probe(instance)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("probe timed out after {timeout:?}")),
            }
        } else if instance.is_expired(timestamp) {
            Err("heartbeat expired".to_string())
        } else {
            Ok(())
        };

        HealthCheckResult {
            instance_id: instance.id.clone(),
            success: outcome.is_ok(),
            latency: timestamp.elapsed(),
            timestamp,
            error: outcome.err(),
        }
    }

    /// 被动信号：真实调用的结果，失败与超时等同于一次失败的探测
    pub fn report_outcome(&self, instance_id: &str, outcome: CallOutcome, latency: Duration) {
        let result = HealthCheckResult {
            instance_id: instance_id.to_string(),
            success: outcome.is_success(),
            latency,
            timestamp: Instant::now(),
            error: (!outcome.is_success()).then(|| format!("call {outcome}")),
        };

        // 被动成功不推迟主动探测，只在被动信号把实例打入 Unhealthy 时开始恢复退避
        if let Some(update) = self.apply_result(&result) {
            if update.changed() && update.current == HealthState::Unhealthy {
                self.schedules.remove(instance_id);
                self.reschedule(instance_id, update.current, result.timestamp);
            }
        }
    }

    fn apply_result(&self, result: &HealthCheckResult) -> Option<HealthUpdate> {
        let applied = if result.success {
            self.registry
                .record_success(&result.instance_id, result.timestamp)
        } else {
            self.registry.record_failure(
                &result.instance_id,
                result.timestamp,
                self.config.failure_threshold,
            )
        };

        match applied {
            Ok(update) => {
                if let Some(error) = &result.error {
                    tracing::debug!(
                        instance_id = %result.instance_id,
                        error = %error,
                        consecutive_failures = update.consecutive_failures,
                        latency_ms = result.latency.as_millis() as u64,
                        "Health check failed"
                    );
                }
                Some(update)
            }
            Err(_) => {
                // 结果返回前实例已被移除
                self.schedules.remove(&result.instance_id);
                None
            }
        }
    }

    fn reschedule(&self, instance_id: &str, state: HealthState, from: Instant) {
        let interval = self.config.probe_interval();
        let mut schedule = self
            .schedules
            .entry(instance_id.to_string())
            .or_insert(ProbeSchedule {
                next_probe_at: from,
                backoff: interval,
            });

        if state == HealthState::Unhealthy {
            // 恢复探测按指数退避，从 probe_interval 开始，封顶 max_recovery_interval
            schedule.next_probe_at = from + schedule.backoff;
            schedule.backoff = (schedule.backoff * 2)
                .min(self.config.max_recovery_interval())
                .max(interval);
        } else {
            schedule.backoff = interval;
            schedule.next_probe_at = from + interval;
        }
    }

    /// 下一次计划探测时间，尚未探测过的实例返回 None
    pub fn next_probe_at(&self, instance_id: &str) -> Option<Instant> {
        self.schedules
            .get(instance_id)
            .map(|schedule| schedule.next_probe_at)
    }

    // 启动后台探测任务
    pub fn start(self: &Arc<Self>, tracker: &TaskTracker, shutdown: CancellationToken) {
        let checker = Arc::clone(self);
        let probe_interval = self.config.probe_interval();

        tracing::info!(
            probe_interval_ms = self.config.probe_interval_ms,
            probe_timeout_ms = self.config.probe_timeout_ms,
            failure_threshold = self.config.failure_threshold,
            "Health checker started"
        );

        tracker.spawn(async move {
            let mut interval = tokio::time::interval(probe_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Health checker shutting down");
                        break;
                    }
                    tick = interval.tick() => {
                        checker.run_probe_round_at(tick).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::health::probe::ProbeError;
    use crate::services::registry::ServiceRegistration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 按地址脚本化的探测器
    #[derive(Debug, Default)]
    struct ScriptedProbe {
        healthy: DashMap<String, bool>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn set(&self, address: &str, healthy: bool) {
            self.healthy.insert(address.to_string(), healthy);
        }
    }

    #[tonic::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.healthy.get(&instance.address).map(|v| *v) {
                Some(true) => Ok(()),
                _ => Err(ProbeError::NotServing(instance.address.clone())),
            }
        }
    }

    #[derive(Debug)]
    struct HangingProbe;

    #[tonic::async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _instance: &ServiceInstance) -> Result<(), ProbeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    // 每次探测耗时 50ms
    #[derive(Debug, Default)]
    struct SlowProbe {
        calls: AtomicUsize,
        failing: bool,
    }

    #[tonic::async_trait]
    impl HealthProbe for SlowProbe {
        async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                Err(ProbeError::NotServing(instance.address.clone()))
            } else {
                Ok(())
            }
        }
    }

    fn setup(probe: Arc<dyn HealthProbe>) -> (Arc<Registry>, HealthChecker) {
        let registry = Arc::new(Registry::default());
        let checker = HealthChecker::new(registry.clone(), probe, HealthCheckConfig::default());
        (registry, checker)
    }

    fn register(registry: &Registry, address: &str) -> String {
        registry
            .register(
                ServiceRegistration::new("health-data", address)
                    .with_health_endpoint(format!("tcp://{address}")),
            )
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_after_threshold() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, checker) = setup(probe.clone());
        let b = register(&registry, "10.0.0.2:80");

        probe.set("10.0.0.2:80", true);
        checker.run_probe_round().await;
        assert_eq!(registry.get(&b).unwrap().state, HealthState::Healthy);

        probe.set("10.0.0.2:80", false);
        for failures in 1..=2 {
            tokio::time::advance(checker.config().probe_interval()).await;
            checker.run_probe_round().await;
            let instance = registry.get(&b).unwrap();
            assert_eq!(instance.state, HealthState::Healthy);
            assert_eq!(instance.consecutive_failures, failures);
        }

        tokio::time::advance(checker.config().probe_interval()).await;
        checker.run_probe_round().await;
        assert_eq!(registry.get(&b).unwrap().state, HealthState::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_probes_every_interval() {
        let probe = Arc::new(SlowProbe::default());
        let (registry, checker) = setup(probe.clone());
        let id = register(&registry, "10.0.0.6:80");
        let checker = Arc::new(checker);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        checker.start(&tracker, shutdown.clone());

        // t = 0, 5, 10, 15, 20
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
        assert_eq!(registry.get(&id).unwrap().state, HealthState::Healthy);

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_failing_probes_demote_on_schedule() {
        let probe = Arc::new(SlowProbe {
            failing: true,
            ..Default::default()
        });
        let (registry, checker) = setup(probe.clone());
        let id = register(&registry, "10.0.0.7:80");
        let checker = Arc::new(checker);

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        checker.start(&tracker, shutdown.clone());

        // 三次失败探测发生在 t = 0, 5, 10
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get(&id).unwrap().state, HealthState::Unhealthy);

        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_uses_exponential_backoff() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, checker) = setup(probe.clone());
        let b = register(&registry, "10.0.0.2:80");
        let interval = checker.config().probe_interval();

        // 三轮失败后进入 Unhealthy
        for _ in 0..3 {
            checker.run_probe_round().await;
            tokio::time::advance(interval).await;
        }
        assert_eq!(registry.get(&b).unwrap().state, HealthState::Unhealthy);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        // 第一次恢复探测间隔为 probe_interval
        checker.run_probe_round().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);

        // 之后间隔翻倍：+5s 不到期，+10s 到期
        tokio::time::advance(interval).await;
        checker.run_probe_round().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        tokio::time::advance(interval).await;
        checker.run_probe_round().await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);

        // 首次成功即恢复，并重置退避
        probe.set("10.0.0.2:80", true);
        tokio::time::advance(interval * 4).await;
        checker.run_probe_round().await;
        assert_eq!(registry.get(&b).unwrap().state, HealthState::Healthy);
        assert_eq!(
            checker.next_probe_at(&b),
            Some(Instant::now() + interval)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let probe = Arc::new(ScriptedProbe::default());
        let registry = Arc::new(Registry::default());
        let config = HealthCheckConfig {
            failure_threshold: 1,
            max_recovery_interval_ms: 12_000,
            ..Default::default()
        };
        let checker = HealthChecker::new(registry.clone(), probe, config);
        let b = register(&registry, "10.0.0.2:80");

        // 退避序列: 5s, 10s, 12s, 12s
        let expected = [5, 10, 12, 12];
        for secs in expected {
            checker.run_probe_round().await;
            let next = checker.next_probe_at(&b).unwrap();
            assert_eq!(next - Instant::now(), Duration::from_secs(secs));
            tokio::time::advance(Duration::from_secs(secs)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let (registry, checker) = setup(Arc::new(HangingProbe));
        let id = register(&registry, "10.0.0.9:80");

        let results = checker.run_probe_round().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(registry.get(&id).unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_failures_share_threshold() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, checker) = setup(probe.clone());
        let id = register(&registry, "10.0.0.3:80");
        probe.set("10.0.0.3:80", true);
        checker.run_probe_round().await;

        checker.report_outcome(&id, CallOutcome::Failure, Duration::from_millis(5));
        tokio::time::advance(Duration::from_millis(1)).await;
        checker.report_outcome(&id, CallOutcome::Timeout, Duration::from_millis(5));
        assert_eq!(registry.get(&id).unwrap().state, HealthState::Healthy);

        tokio::time::advance(Duration::from_millis(1)).await;
        checker.report_outcome(&id, CallOutcome::Failure, Duration::from_millis(5));
        assert_eq!(registry.get(&id).unwrap().state, HealthState::Unhealthy);

        // 被动打入 Unhealthy 后，恢复探测在 probe_interval 后进行
        assert_eq!(
            checker.next_probe_at(&id),
            Some(Instant::now() + checker.config().probe_interval())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_without_endpoint_uses_heartbeat() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, checker) = setup(probe.clone());
        let id = registry
            .register(ServiceRegistration::new("community", "10.0.0.4:80"))
            .unwrap();

        checker.run_probe_round().await;
        assert_eq!(registry.get(&id).unwrap().state, HealthState::Healthy);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_dropped_for_removed_instances() {
        let probe = Arc::new(ScriptedProbe::default());
        let (registry, checker) = setup(probe);
        let id = register(&registry, "10.0.0.5:80");

        checker.run_probe_round().await;
        assert!(checker.next_probe_at(&id).is_some());

        registry.deregister(&id);
        checker.run_probe_round().await;
        assert!(checker.next_probe_at(&id).is_none());
    }
}
