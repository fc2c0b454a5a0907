use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};

use super::strategy;
use super::types::{InstanceLoadStats, LoadBalancerConfig, LoadBalancerStrategy};
use crate::services::circuit::CircuitBreaker;
use crate::services::error::DiscoveryError;
use crate::services::registry::{Registry, ServiceInstance};

#[derive(Debug, Default)]
struct InstanceLoad {
    outstanding: AtomicUsize,
    total_selections: AtomicU64,
}

/// 在途调用计数守卫，drop 时自动减一
#[derive(Debug)]
pub struct OutstandingGuard {
    load: Arc<InstanceLoad>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.load.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 负载均衡器
///
/// 可选集合 = 注册表快照 ∩ Healthy ∩ 未摘流 ∩ 熔断器允许调用的实例。
#[derive(Debug)]
pub struct LoadBalancer {
    registry: Arc<Registry>,
    breaker: Arc<CircuitBreaker>,
    config: LoadBalancerConfig,
    // 运行时覆盖的策略
    strategies: DashMap<String, LoadBalancerStrategy>,
    // 服务名 -> 轮询游标
    cursors: DashMap<String, Arc<AtomicUsize>>,
    // 实例ID -> 负载计数
    loads: DashMap<String, Arc<InstanceLoad>>,
    // 手动摘流的实例ID
    drained: DashSet<String>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<Registry>,
        breaker: Arc<CircuitBreaker>,
        config: LoadBalancerConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            config,
            strategies: DashMap::new(),
            cursors: DashMap::new(),
            loads: DashMap::new(),
            drained: DashSet::new(),
        }
    }

    pub fn strategy_for(&self, service_name: &str) -> LoadBalancerStrategy {
        if let Some(strategy) = self.strategies.get(service_name) {
            return *strategy;
        }
        self.config
            .service_strategies
            .get(service_name)
            .copied()
            .unwrap_or(self.config.strategy)
    }

    pub fn set_strategy(&self, service_name: &str, strategy: LoadBalancerStrategy) {
        tracing::info!(
            service_name = %service_name,
            strategy = %strategy,
            "Load balancer strategy updated"
        );
        self.strategies.insert(service_name.to_string(), strategy);
    }

    /// 按配置的策略选择一个可用实例
    pub fn select(&self, service_name: &str) -> Result<ServiceInstance, DiscoveryError> {
        self.select_with(service_name, None, &HashSet::new())
    }

    /// 选择实例
    ///
    /// `sticky_key` 不为空时按一致性哈希优先返回该 key 对应的实例，
    /// 该实例不可用时退回到配置的策略；`excluded` 中的实例不会被选中（用于重试）。
    pub fn select_with(
        &self,
        service_name: &str,
        sticky_key: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Result<ServiceInstance, DiscoveryError> {
        let instances = self.registry.list(service_name);
        if instances.is_empty() && !self.registry.contains_service(service_name) {
            return Err(DiscoveryError::NotFound(format!("service {service_name}")));
        }

        let healthy: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|instance| {
                instance.is_healthy()
                    && !excluded.contains(&instance.id)
                    && !self.drained.contains(&instance.id)
            })
            .collect();
        let eligible: Vec<&ServiceInstance> = healthy
            .iter()
            .copied()
            .filter(|instance| self.breaker.is_selectable(service_name, &instance.id))
            .collect();

        if eligible.is_empty() {
            // 有健康实例但全部被熔断
            if let Some(gated) = healthy.first() {
                return Err(DiscoveryError::CircuitOpen {
                    service_name: service_name.to_string(),
                    instance_id: gated.id.clone(),
                });
            }
            return Err(DiscoveryError::NoHealthyInstance {
                service_name: service_name.to_string(),
            });
        }

        let sticky = sticky_key
            .and_then(|key| strategy::rendezvous_owner(key, &instances))
            .filter(|owner| eligible.iter().any(|instance| instance.id == owner.id));

        let chosen = match sticky {
            Some(owner) => owner,
            None => match self.strategy_for(service_name) {
                LoadBalancerStrategy::RoundRobin => {
                    strategy::round_robin(&eligible, self.next_cursor(service_name))
                }
                LoadBalancerStrategy::WeightedRandom => strategy::weighted_random(&eligible),
                LoadBalancerStrategy::LeastOutstanding => strategy::least_outstanding(
                    &eligible,
                    self.next_cursor(service_name),
                    |instance_id| self.outstanding(instance_id),
                ),
            },
        };

        self.load(&chosen.id)
            .total_selections
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            service_name = %service_name,
            instance_id = %chosen.id,
            address = %chosen.address,
            eligible_count = eligible.len(),
            sticky = sticky.is_some(),
            "Selected instance"
        );

        Ok(chosen.clone())
    }

    fn next_cursor(&self, service_name: &str) -> usize {
        let cursor = match self.cursors.get(service_name) {
            Some(cursor) => cursor.value().clone(),
            None => self
                .cursors
                .entry(service_name.to_string())
                .or_default()
                .value()
                .clone(),
        };
        cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn load(&self, instance_id: &str) -> Arc<InstanceLoad> {
        match self.loads.get(instance_id) {
            Some(load) => load.value().clone(),
            None => self
                .loads
                .entry(instance_id.to_string())
                .or_default()
                .value()
                .clone(),
        }
    }

    /// 标记一次在途调用，返回的守卫 drop 时结束
    pub fn begin(&self, instance_id: &str) -> OutstandingGuard {
        let load = self.load(instance_id);
        load.outstanding.fetch_add(1, Ordering::AcqRel);
        OutstandingGuard { load }
    }

    pub fn outstanding(&self, instance_id: &str) -> usize {
        self.loads
            .get(instance_id)
            .map(|load| load.outstanding.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 当前注册实例的负载统计
    pub fn stats(&self, service_name: &str) -> Vec<InstanceLoadStats> {
        self.registry
            .list(service_name)
            .into_iter()
            .map(|instance| {
                let (outstanding, total_selections) = self
                    .loads
                    .get(&instance.id)
                    .map(|load| {
                        (
                            load.outstanding.load(Ordering::Acquire),
                            load.total_selections.load(Ordering::Relaxed),
                        )
                    })
                    .unwrap_or_default();
                InstanceLoadStats {
                    instance_id: instance.id,
                    outstanding,
                    total_selections,
                }
            })
            .collect()
    }

    /// 摘流：实例保留在注册表中，但不再被选中
    ///
    /// 返回 false 表示实例已处于摘流状态。
    pub fn drain(&self, instance_id: &str) -> bool {
        let inserted = self.drained.insert(instance_id.to_string());
        if inserted {
            tracing::info!(instance_id = %instance_id, "Instance drained");
        }
        inserted
    }

    /// 恢复摘流的实例
    pub fn undrain(&self, instance_id: &str) -> bool {
        let removed = self.drained.remove(instance_id).is_some();
        if removed {
            tracing::info!(instance_id = %instance_id, "Instance undrained");
        }
        removed
    }

    pub fn is_drained(&self, instance_id: &str) -> bool {
        self.drained.contains(instance_id)
    }

    /// 实例移除后清理其负载计数和摘流标记
    pub fn forget(&self, instance_id: &str) {
        self.loads.remove(instance_id);
        self.drained.remove(instance_id);
    }
}
