use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tonic::transport::{Channel, Endpoint};

use super::config::RegistrationClientConfig;
use super::error::RegistrationClientError;
use crate::discovery::{
    self as proto, DeregisterRequest, HeartbeatRequest, ListInstancesRequest, RegisterRequest,
    registry_service_client::RegistryServiceClient,
};
use crate::services::registry::ServiceRegistration;
use crate::services::registry::grpc_impl::metadata_to_proto;

/// 远程注册客户端
///
/// 业务服务通过它向注册中心注册自身，并在后台维持心跳。
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    config: RegistrationClientConfig,
    client: RegistryServiceClient<Channel>,
}

impl RegistrationClient {
    /// 创建新的注册客户端
    pub async fn new(config: RegistrationClientConfig) -> Result<Self, RegistrationClientError> {
        if config.heartbeat_interval.is_zero() || config.request_timeout.is_zero() {
            return Err(RegistrationClientError::InvalidConfig(
                "heartbeat_interval and request_timeout must be greater than zero".to_string(),
            ));
        }

        let endpoint = Endpoint::from_shared(config.registry_address.clone())?
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        let channel = endpoint.connect().await?;
        let client = RegistryServiceClient::new(channel);

        Ok(Self { config, client })
    }

    /// 便捷的创建方法，使用默认配置
    pub async fn connect(registry_address: &str) -> Result<Self, RegistrationClientError> {
        let config = RegistrationClientConfig {
            registry_address: registry_address.to_string(),
            ..Default::default()
        };
        Self::new(config).await
    }

    /// 注册实例并启动心跳任务
    pub async fn register(
        &self,
        registration: ServiceRegistration,
    ) -> Result<Registration, RegistrationClientError> {
        let request = register_request(registration);
        let mut client = self.client.clone();
        let instance_id = client
            .register(request.clone())
            .await
            .map_err(|status| match status.code() {
                Code::InvalidArgument => RegistrationClientError::Rejected(status.message().to_string()),
                _ => RegistrationClientError::Grpc(status),
            })?
            .into_inner()
            .instance_id;

        tracing::info!(
            service_name = %request.service_name,
            address = %request.address,
            instance_id = %instance_id,
            "Registered with registry"
        );

        let (id_tx, id_rx) = watch::channel(instance_id);
        let shutdown = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            client.clone(),
            request,
            id_tx,
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        Ok(Registration {
            instance_id: id_rx,
            shutdown,
            heartbeat,
            client,
        })
    }

    /// 查询服务实例列表
    pub async fn list_instances(
        &self,
        service_name: &str,
        healthy_only: bool,
    ) -> Result<Vec<proto::Instance>, RegistrationClientError> {
        let mut client = self.client.clone();
        let response = client
            .list_instances(ListInstancesRequest {
                service_name: service_name.to_string(),
                healthy_only,
            })
            .await?;
        Ok(response.into_inner().instances)
    }
}

/// 一次远程注册，持有心跳任务
#[derive(Debug)]
pub struct Registration {
    instance_id: watch::Receiver<String>,
    shutdown: CancellationToken,
    heartbeat: JoinHandle<()>,
    client: RegistryServiceClient<Channel>,
}

impl Registration {
    /// 当前实例ID，注册中心丢失实例后重新注册会产生新ID
    pub fn instance_id(&self) -> String {
        self.instance_id.borrow().clone()
    }

    /// 停止心跳并注销实例
    pub async fn deregister(mut self) -> Result<bool, RegistrationClientError> {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.heartbeat).await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }

        let instance_id = self.instance_id();
        let removed = self
            .client
            .deregister(DeregisterRequest {
                instance_id: instance_id.clone(),
            })
            .await?
            .into_inner()
            .removed;

        tracing::info!(instance_id = %instance_id, removed, "Deregistered from registry");
        Ok(removed)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn register_request(registration: ServiceRegistration) -> RegisterRequest {
    RegisterRequest {
        service_name: registration.service_name,
        address: registration.address,
        metadata: Some(metadata_to_proto(registration.metadata)),
        health_endpoint: registration.health_endpoint.unwrap_or_default(),
        ttl_ms: registration
            .ttl
            .map(|ttl| ttl.as_millis() as u64)
            .unwrap_or_default(),
    }
}

async fn heartbeat_loop(
    mut client: RegistryServiceClient<Channel>,
    request: RegisterRequest,
    instance_id: watch::Sender<String>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，注册本身已经刷新过心跳
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Heartbeat loop stopped");
                break;
            }
            _ = interval.tick() => {
                let current = instance_id.borrow().clone();
                match client.heartbeat(HeartbeatRequest { instance_id: current.clone() }).await {
                    Ok(_) => tracing::trace!(instance_id = %current, "Heartbeat sent"),
                    Err(status) if status.code() == Code::NotFound => {
                        // 实例已被注册中心清理，重新注册
                        tracing::warn!(instance_id = %current, "Instance unknown to registry, re-registering");
                        match client.register(request.clone()).await {
                            Ok(response) => {
                                let new_id = response.into_inner().instance_id;
                                tracing::info!(instance_id = %new_id, "Re-registered with registry");
                                instance_id.send_replace(new_id);
                            }
                            Err(status) => {
                                tracing::warn!(error = %status, "Re-registration failed");
                            }
                        }
                    }
                    Err(status) => {
                        tracing::warn!(instance_id = %current, error = %status, "Heartbeat failed");
                    }
                }
            }
        }
    }
}
