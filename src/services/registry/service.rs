use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::events::{EventChannel, RegistryEvent};
use super::types::{
    HealthState, HealthUpdate, InstanceMetadata, RegistryConfig, ServiceHealthSummary,
    ServiceInstance, ServiceRegistration,
};
use crate::services::error::DiscoveryError;

pub type ServiceInstances = Arc<DashMap<String, ServiceInstance>>;

// 服务名 -> 实例集合，外层按服务名分片加锁
pub type ServiceRegistry = DashMap<String, ServiceInstances>;

/// 进程内权威服务注册表
#[derive(Debug)]
pub struct Registry {
    services: ServiceRegistry,
    // 实例ID -> 服务名
    instance_index: DashMap<String, String>,
    // (服务名, 地址) -> 实例ID，保证同一实例不会以两个ID出现
    address_index: DashMap<(String, String), String>,
    events: EventChannel,
    config: RegistryConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            services: DashMap::new(),
            instance_index: DashMap::new(),
            address_index: DashMap::new(),
            events: EventChannel::new(config.event_channel_capacity),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 注册实例，返回实例ID
    ///
    /// 同一服务下相同地址的重复注册会刷新已有实例并返回原来的ID。
    pub fn register(&self, registration: ServiceRegistration) -> Result<String, DiscoveryError> {
        Self::validate(&registration)?;

        let ServiceRegistration {
            service_name,
            address,
            metadata,
            health_endpoint,
            ttl,
        } = registration;
        let service_name = service_name.trim().to_string();
        let address = address.trim().to_string();
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());

        match self
            .address_index
            .entry((service_name.clone(), address.clone()))
        {
            Entry::Occupied(mut entry) => {
                let existing_id = entry.get().clone();
                if self.refresh_existing(
                    &service_name,
                    &existing_id,
                    &metadata,
                    &health_endpoint,
                    ttl,
                ) {
                    tracing::info!(
                        service_name = %service_name,
                        address = %address,
                        instance_id = %existing_id,
                        "Instance already registered, refreshed existing registration"
                    );
                    return Ok(existing_id);
                }

                // 索引残留但实例已被清理，按新实例处理
                let instance =
                    self.store_new(service_name, address, metadata, health_endpoint, ttl);
                entry.insert(instance.id.clone());
                Ok(self.announce_registered(instance))
            }
            Entry::Vacant(entry) => {
                let instance =
                    self.store_new(service_name, address, metadata, health_endpoint, ttl);
                entry.insert(instance.id.clone());
                Ok(self.announce_registered(instance))
            }
        }
    }

    fn validate(registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        if registration.service_name.trim().is_empty() {
            return Err(DiscoveryError::Registration(
                "service name is required".to_string(),
            ));
        }
        let address = registration.address.trim();
        if address.is_empty() {
            return Err(DiscoveryError::Registration(
                "address is required".to_string(),
            ));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(DiscoveryError::Registration(format!(
                "address must not contain whitespace: {address:?}"
            )));
        }
        if registration.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(DiscoveryError::Registration(
                "ttl must be greater than zero".to_string(),
            ));
        }
        if registration
            .health_endpoint
            .as_deref()
            .is_some_and(|endpoint| endpoint.trim().is_empty())
        {
            return Err(DiscoveryError::Registration(
                "health endpoint must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    fn refresh_existing(
        &self,
        service_name: &str,
        instance_id: &str,
        metadata: &InstanceMetadata,
        health_endpoint: &Option<String>,
        ttl: std::time::Duration,
    ) -> bool {
        let Some(instances) = self.shard(service_name) else {
            return false;
        };
        let Some(mut instance) = instances.get_mut(instance_id) else {
            return false;
        };
        instance.metadata = metadata.clone();
        instance.health_endpoint = health_endpoint.clone();
        instance.ttl = ttl;
        instance.update_heartbeat();
        true
    }

    fn store_new(
        &self,
        service_name: String,
        address: String,
        metadata: InstanceMetadata,
        health_endpoint: Option<String>,
        ttl: std::time::Duration,
    ) -> ServiceInstance {
        let now = Instant::now();
        let instance = ServiceInstance {
            id: Uuid::new_v4().to_string(),
            service_name: service_name.clone(),
            address,
            metadata,
            health_endpoint,
            ttl,
            state: HealthState::Unknown,
            last_heartbeat: now,
            registered_at: now,
            consecutive_failures: 0,
            last_checked_at: None,
        };

        self.services
            .entry(service_name.clone())
            .or_default()
            .insert(instance.id.clone(), instance.clone());
        self.instance_index.insert(instance.id.clone(), service_name);

        instance
    }

    fn announce_registered(&self, instance: ServiceInstance) -> String {
        tracing::info!(
            service_name = %instance.service_name,
            address = %instance.address,
            instance_id = %instance.id,
            ttl_ms = instance.ttl.as_millis() as u64,
            "Registered service instance"
        );
        let id = instance.id.clone();
        self.events.publish(RegistryEvent::Registered { instance });
        id
    }

    /// 注销实例，ID 不存在时不报错
    pub fn deregister(&self, instance_id: &str) -> Option<ServiceInstance> {
        let (_, service_name) = self.instance_index.remove(instance_id)?;
        let removed = self
            .shard(&service_name)
            .and_then(|instances| instances.remove(instance_id))
            .map(|(_, instance)| instance)?;

        self.address_index.remove_if(
            &(removed.service_name.clone(), removed.address.clone()),
            |_, id| id == instance_id,
        );

        tracing::info!(
            service_name = %removed.service_name,
            instance_id = %instance_id,
            "Deregistered service instance"
        );
        self.events.publish(RegistryEvent::Deregistered {
            instance: removed.clone(),
        });
        Some(removed)
    }

    /// 刷新心跳时间
    pub fn heartbeat(&self, instance_id: &str) -> Result<(), DiscoveryError> {
        let instances = self.shard_for(instance_id)?;
        let mut instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found(instance_id))?;
        instance.update_heartbeat();

        tracing::debug!(
            service_name = %instance.service_name,
            instance_id = %instance_id,
            "Updated instance heartbeat"
        );
        Ok(())
    }

    /// 返回服务的实例快照，已超过 TTL 的实例即使尚未被清理也不会返回
    pub fn list(&self, service_name: &str) -> Vec<ServiceInstance> {
        let now = Instant::now();
        let Some(instances) = self.services.get(service_name) else {
            return Vec::new();
        };
        let mut snapshot: Vec<ServiceInstance> = instances
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        drop(instances);

        snapshot.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        snapshot
    }

    // 获取实例信息
    pub fn get(&self, instance_id: &str) -> Option<ServiceInstance> {
        let instances = self.shard_for(instance_id).ok()?;
        let instance = instances.get(instance_id)?;
        Some(instance.value().clone())
    }

    /// 已知的服务名（注册过的服务名在进程生命周期内保留）
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn contains_service(&self, service_name: &str) -> bool {
        self.services.contains_key(service_name)
    }

    /// 当前实例总数（含尚未清理的过期实例）
    pub fn len(&self) -> usize {
        self.instance_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_index.is_empty()
    }

    /// 替换实例元数据
    pub fn update_metadata(
        &self,
        instance_id: &str,
        metadata: InstanceMetadata,
    ) -> Result<(), DiscoveryError> {
        let instances = self.shard_for(instance_id)?;
        let service_name = {
            let mut instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| Self::not_found(instance_id))?;
            instance.metadata = metadata;
            instance.service_name.clone()
        };

        tracing::info!(
            service_name = %service_name,
            instance_id = %instance_id,
            "Updated instance metadata"
        );
        self.events.publish(RegistryEvent::MetadataUpdated {
            service_name,
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }

    // 获取服务健康汇总
    pub fn service_health(&self, service_name: &str) -> ServiceHealthSummary {
        self.list(service_name)
            .iter()
            .fold(ServiceHealthSummary::default(), |mut summary, instance| {
                summary.total += 1;
                match instance.state {
                    HealthState::Healthy => summary.healthy += 1,
                    HealthState::Unhealthy => summary.unhealthy += 1,
                    HealthState::Unknown => summary.unknown += 1,
                }
                summary
            })
    }

    /// 应用一次成功的健康信号：清零连续失败计数并标记为 Healthy
    pub fn record_success(
        &self,
        instance_id: &str,
        at: Instant,
    ) -> Result<HealthUpdate, DiscoveryError> {
        self.apply_health_signal(instance_id, at, |instance| {
            instance.consecutive_failures = 0;
            instance.state = HealthState::Healthy;
        })
    }

    /// 应用一次失败的健康信号，连续失败达到阈值时标记为 Unhealthy
    pub fn record_failure(
        &self,
        instance_id: &str,
        at: Instant,
        failure_threshold: u32,
    ) -> Result<HealthUpdate, DiscoveryError> {
        let threshold = failure_threshold.max(1);
        self.apply_health_signal(instance_id, at, |instance| {
            instance.consecutive_failures = instance.consecutive_failures.saturating_add(1);
            if instance.consecutive_failures >= threshold {
                instance.state = HealthState::Unhealthy;
            }
        })
    }

    fn apply_health_signal<F>(
        &self,
        instance_id: &str,
        at: Instant,
        apply: F,
    ) -> Result<HealthUpdate, DiscoveryError>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let instances = self.shard_for(instance_id)?;
        let (update, service_name) = {
            let mut instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| Self::not_found(instance_id))?;
            let previous = instance.state;

            // 以时间戳为准，后写者胜
            if instance.last_checked_at.is_some_and(|last| at < last) {
                return Ok(HealthUpdate {
                    previous,
                    current: previous,
                    consecutive_failures: instance.consecutive_failures,
                    applied: false,
                });
            }

            instance.last_checked_at = Some(at);
            apply(instance.value_mut());
            (
                HealthUpdate {
                    previous,
                    current: instance.state,
                    consecutive_failures: instance.consecutive_failures,
                    applied: true,
                },
                instance.service_name.clone(),
            )
        };

        if update.changed() {
            if update.current == HealthState::Unhealthy {
                tracing::warn!(
                    service_name = %service_name,
                    instance_id = %instance_id,
                    consecutive_failures = update.consecutive_failures,
                    "Instance marked unhealthy"
                );
            } else {
                tracing::info!(
                    service_name = %service_name,
                    instance_id = %instance_id,
                    from = %update.previous,
                    to = %update.current,
                    "Instance health state changed"
                );
            }
            self.events.publish(RegistryEvent::HealthChanged {
                service_name,
                instance_id: instance_id.to_string(),
                from: update.previous,
                to: update.current,
            });
        }

        Ok(update)
    }

    /// 清理超过 TTL 的实例，返回被移除的实例
    pub fn sweep_expired(&self) -> Vec<ServiceInstance> {
        let now = Instant::now();
        let shards: Vec<(String, ServiceInstances)> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired = Vec::new();
        for (service_name, instances) in shards {
            let candidates: Vec<String> = instances
                .iter()
                .filter(|entry| entry.value().is_expired(now))
                .map(|entry| entry.key().clone())
                .collect();

            for instance_id in candidates {
                // 收集与删除之间可能收到心跳，删除时再判断一次
                let Some((_, instance)) =
                    instances.remove_if(&instance_id, |_, instance| instance.is_expired(now))
                else {
                    continue;
                };

                tracing::warn!(
                    service_name = %service_name,
                    instance_id = %instance_id,
                    elapsed_ms = now.saturating_duration_since(instance.last_heartbeat).as_millis() as u64,
                    ttl_ms = instance.ttl.as_millis() as u64,
                    "Instance expired due to heartbeat timeout, removing from registry"
                );
                self.instance_index
                    .remove_if(&instance_id, |_, name| name == &service_name);
                self.address_index.remove_if(
                    &(instance.service_name.clone(), instance.address.clone()),
                    |_, id| id == &instance_id,
                );
                expired.push(instance);
            }
        }

        for instance in &expired {
            self.events.publish(RegistryEvent::Expired {
                instance: instance.clone(),
            });
        }
        expired
    }

    // 启动定期过期清理任务
    pub fn start_expiry_sweep(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) {
        let registry = Arc::clone(self);
        let check_interval = self.config.ttl_check_interval();

        tracker.spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Registry expiry sweep stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        tracing::debug!("Executing instance expiration check...");
                        let expired = registry.sweep_expired();
                        if !expired.is_empty() {
                            tracing::info!(
                                expired_count = expired.len(),
                                "Cleanup check completed, removed expired instances"
                            );
                        }
                    }
                }
            }
        });
    }

    /// 订阅注册表事件流
    pub fn subscribe(&self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        self.events.stream()
    }

    pub fn subscribe_receiver(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.receiver()
    }

    fn shard(&self, service_name: &str) -> Option<ServiceInstances> {
        self.services
            .get(service_name)
            .map(|entry| entry.value().clone())
    }

    fn shard_for(&self, instance_id: &str) -> Result<ServiceInstances, DiscoveryError> {
        let service_name = self
            .instance_index
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Self::not_found(instance_id))?;
        self.shard(&service_name)
            .ok_or_else(|| Self::not_found(instance_id))
    }

    fn not_found(instance_id: &str) -> DiscoveryError {
        DiscoveryError::NotFound(format!("instance {instance_id}"))
    }
}
