use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::{ClientConfig, DiscoveryConfig};
use super::options::InvokeOptions;
use crate::services::balancer::{InstanceLoadStats, LoadBalancer};
use crate::services::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::services::error::{BoxError, DiscoveryError};
use crate::services::health::{EndpointProbe, HealthChecker, HealthProbe};
use crate::services::outcome::CallOutcome;
use crate::services::registry::{
    Registry, RegistryEvent, ServiceHealthSummary, ServiceInstance, ServiceRegistration,
};

/// 服务发现客户端
///
/// 持有注册表、健康检查器、熔断器和负载均衡器，所有状态都归这一个对象所有。
/// 后台任务（过期清理、主动探测、事件监听）由 `start()`/`stop()` 控制。
#[derive(Debug)]
pub struct DiscoveryClient {
    registry: Arc<Registry>,
    health_checker: Arc<HealthChecker>,
    circuit_breaker: Arc<CircuitBreaker>,
    load_balancer: Arc<LoadBalancer>,
    config: ClientConfig,
    task_tracker: TaskTracker,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl DiscoveryClient {
    /// 校验配置并创建客户端，配置非法时返回 `DiscoveryError::Config`
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let probe = Arc::new(EndpointProbe::new(config.health.probe_timeout()));
        Self::with_probe(config, probe)
    }

    /// 使用自定义探测器创建客户端
    pub fn with_probe(
        config: DiscoveryConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;

        let registry = Arc::new(Registry::new(config.registry));
        let health_checker = Arc::new(HealthChecker::new(
            Arc::clone(&registry),
            probe,
            config.health,
        ));
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker));
        let load_balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&circuit_breaker),
            config.load_balancer,
        ));

        Ok(Self {
            registry,
            health_checker,
            circuit_breaker,
            load_balancer,
            config: config.client,
            task_tracker: TaskTracker::new(),
            shutdown: Mutex::new(None),
        })
    }

    /// 启动后台任务，重复调用无副作用
    pub fn start(&self) {
        let mut shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_some() {
            tracing::debug!("Discovery client already running");
            return;
        }

        let token = CancellationToken::new();
        self.task_tracker.reopen();
        self.registry
            .start_expiry_sweep(&self.task_tracker, token.child_token());
        self.health_checker
            .start(&self.task_tracker, token.child_token());
        self.spawn_event_listener(token.child_token());
        *shutdown = Some(token);

        tracing::info!("Discovery client started");
    }

    /// 停止后台任务并等待它们退出
    pub async fn stop(&self) {
        let token = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(token) = token else {
            return;
        };

        token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        tracing::info!("Discovery client stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // 实例移除后清理负载均衡器中的计数
    fn spawn_event_listener(&self, shutdown: CancellationToken) {
        let mut events = self.registry.subscribe_receiver();
        let load_balancer = Arc::clone(&self.load_balancer);

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event @ (RegistryEvent::Deregistered { .. } | RegistryEvent::Expired { .. })) => {
                            load_balancer.forget(event.instance_id());
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Registry event listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    pub fn register(&self, registration: ServiceRegistration) -> Result<String, DiscoveryError> {
        self.registry.register(registration)
    }

    pub fn deregister(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.registry.deregister(instance_id)
    }

    pub fn heartbeat(&self, instance_id: &str) -> Result<(), DiscoveryError> {
        self.registry.heartbeat(instance_id)
    }

    pub fn list(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.registry.list(service_name)
    }

    pub fn service_health(&self, service_name: &str) -> ServiceHealthSummary {
        self.registry.service_health(service_name)
    }

    pub fn subscribe(&self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        self.registry.subscribe()
    }

    pub fn circuit_snapshot(&self, service_name: &str, instance_id: &str) -> Option<CircuitSnapshot> {
        self.circuit_breaker.snapshot(service_name, instance_id)
    }

    pub fn load_stats(&self, service_name: &str) -> Vec<InstanceLoadStats> {
        self.load_balancer.stats(service_name)
    }

    /// 将实例摘流，invoke 不再选中它直到 `undrain`
    pub fn drain(&self, instance_id: &str) -> bool {
        self.load_balancer.drain(instance_id)
    }

    pub fn undrain(&self, instance_id: &str) -> bool {
        self.load_balancer.undrain(instance_id)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    /// 选择一个实例并执行 `request_fn`
    ///
    /// 每次尝试都受超时约束，结果回写熔断器和健康检查器。
    /// 只有幂等调用会在失败后换一个实例重试；`NotFound` 和 `Config` 错误从不重试。
    pub async fn invoke<T, E, F, Fut>(
        &self,
        service_name: &str,
        mut request_fn: F,
        opts: InvokeOptions,
    ) -> Result<T, DiscoveryError>
    where
        F: FnMut(ServiceInstance) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let timeout = opts.timeout.unwrap_or_else(|| self.config.default_timeout());
        if timeout.is_zero() {
            return Err(DiscoveryError::Config(
                "invoke timeout must be greater than zero".to_string(),
            ));
        }

        let max_attempts = if opts.idempotent {
            1u32.saturating_add(opts.max_retries.unwrap_or(self.config.max_retries))
        } else {
            1
        };

        let mut excluded = HashSet::new();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }

            let instance = match self.load_balancer.select_with(
                service_name,
                opts.sticky_key.as_deref(),
                &excluded,
            ) {
                Ok(instance) => instance,
                // 重试时没有其他可用实例，返回上一次调用的错误
                Err(err) => return Err(last_error.unwrap_or(err)),
            };

            match self
                .attempt(service_name, &instance, &mut request_fn, timeout)
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 < max_attempts {
                        tracing::debug!(
                            service_name = %service_name,
                            instance_id = %instance.id,
                            attempt = attempt + 1,
                            error = %err,
                            "Call failed, retrying on another instance"
                        );
                    }
                    excluded.insert(instance.id);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DiscoveryError::NoHealthyInstance {
            service_name: service_name.to_string(),
        }))
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        service_name: &str,
        instance: &ServiceInstance,
        request_fn: &mut F,
        timeout: Duration,
    ) -> Result<T, DiscoveryError>
    where
        F: FnMut(ServiceInstance) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        // 选中后熔断器可能已经打开，此时不调用 request_fn
        let permit = self.circuit_breaker.try_acquire(service_name, &instance.id)?;
        let _in_flight = self.load_balancer.begin(&instance.id);

        let started = Instant::now();
        let response = tokio::time::timeout(timeout, request_fn(instance.clone())).await;
        let latency = started.elapsed();

        let (outcome, result) = match response {
            Ok(Ok(value)) => (CallOutcome::Success, Ok(value)),
            Ok(Err(err)) => (
                CallOutcome::Failure,
                Err(DiscoveryError::Request {
                    instance_id: instance.id.clone(),
                    source: err.into(),
                }),
            ),
            Err(_) => (CallOutcome::Timeout, Err(DiscoveryError::Timeout(timeout))),
        };

        let state = permit.record(outcome);
        self.health_checker
            .report_outcome(&instance.id, outcome, latency);

        if !outcome.is_success() {
            tracing::warn!(
                service_name = %service_name,
                instance_id = %instance.id,
                address = %instance.address,
                outcome = %outcome,
                circuit_state = ?state,
                latency_ms = latency.as_millis() as u64,
                "Call to instance failed"
            );
        }

        result
    }

    // 带抖动的指数退避：[delay/2, delay]
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff();
        if base.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = base
            .saturating_mul(1 << exponent)
            .min(self.config.max_retry_backoff().max(base));
        let half = delay.as_millis() as u64 / 2;
        Duration::from_millis(half + rand::random_range(0..=half))
    }
}
