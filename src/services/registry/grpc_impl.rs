use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tonic::{Request, Response, Status};

use super::service::Registry;
use super::types::{HealthState, InstanceMetadata, ServiceInstance, ServiceRegistration};
use crate::discovery::{
    self as proto, DeregisterRequest, DeregisterResponse, HeartbeatRequest, HeartbeatResponse,
    ListInstancesRequest, ListInstancesResponse, RegisterRequest, RegisterResponse,
    ServiceHealthRequest, ServiceHealthResponse, registry_service_server::RegistryService,
};

// 注册中心 gRPC 服务，供其他进程中的业务服务注册/心跳/注销
#[derive(Debug, Clone)]
pub struct RegistryGrpcService {
    registry: Arc<Registry>,
}

impl RegistryGrpcService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

// 为结构体实现 gRPC 服务 trait
#[tonic::async_trait]
impl RegistryService for RegistryGrpcService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let registration = ServiceRegistration {
            service_name: req.service_name,
            address: req.address,
            metadata: req.metadata.map(metadata_from_proto).unwrap_or_default(),
            health_endpoint: Some(req.health_endpoint).filter(|endpoint| !endpoint.is_empty()),
            ttl: (req.ttl_ms > 0).then(|| Duration::from_millis(req.ttl_ms)),
        };

        let instance_id = self.registry.register(registration)?;
        Ok(Response::new(RegisterResponse { instance_id }))
    }

    async fn deregister(
        &self,
        request: Request<DeregisterRequest>,
    ) -> Result<Response<DeregisterResponse>, Status> {
        let req = request.into_inner();
        let removed = self.registry.deregister(&req.instance_id).is_some();
        Ok(Response::new(DeregisterResponse { removed }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        self.registry.heartbeat(&req.instance_id)?;
        Ok(Response::new(HeartbeatResponse {}))
    }

    async fn list_instances(
        &self,
        request: Request<ListInstancesRequest>,
    ) -> Result<Response<ListInstancesResponse>, Status> {
        let req = request.into_inner();
        let now = Instant::now();
        let instances = self
            .registry
            .list(&req.service_name)
            .into_iter()
            .filter(|instance| !req.healthy_only || instance.is_healthy())
            .map(|instance| instance_to_proto(instance, now))
            .collect();

        Ok(Response::new(ListInstancesResponse { instances }))
    }

    async fn service_health(
        &self,
        request: Request<ServiceHealthRequest>,
    ) -> Result<Response<ServiceHealthResponse>, Status> {
        let req = request.into_inner();
        let summary = self.registry.service_health(&req.service_name);
        Ok(Response::new(ServiceHealthResponse {
            total: summary.total as u32,
            healthy: summary.healthy as u32,
            unhealthy: summary.unhealthy as u32,
            unknown: summary.unknown as u32,
        }))
    }
}

pub(crate) fn metadata_from_proto(metadata: proto::InstanceMetadata) -> InstanceMetadata {
    InstanceMetadata {
        version: metadata.version,
        tags: metadata.tags,
        weight: metadata.weight,
        labels: metadata.labels,
    }
}

pub(crate) fn metadata_to_proto(metadata: InstanceMetadata) -> proto::InstanceMetadata {
    proto::InstanceMetadata {
        version: metadata.version,
        tags: metadata.tags,
        weight: metadata.weight,
        labels: metadata.labels,
    }
}

fn instance_to_proto(instance: ServiceInstance, now: Instant) -> proto::Instance {
    let state = match instance.state {
        HealthState::Unknown => proto::HealthState::Unknown,
        HealthState::Healthy => proto::HealthState::Healthy,
        HealthState::Unhealthy => proto::HealthState::Unhealthy,
    };
    proto::Instance {
        last_heartbeat_age_ms: now
            .saturating_duration_since(instance.last_heartbeat)
            .as_millis() as u64,
        id: instance.id,
        service_name: instance.service_name,
        address: instance.address,
        metadata: Some(metadata_to_proto(instance.metadata)),
        state: state as i32,
        consecutive_failures: instance.consecutive_failures,
        health_endpoint: instance.health_endpoint.unwrap_or_default(),
    }
}
