use std::sync::Arc;

use dashmap::DashMap;
use tonic::{Request, Response, Status};

use crate::discovery::{
    HealthCheckRequest, HealthCheckResponse, health_check_response::ServingStatus,
    health_service_server::HealthService,
};

/// 健康端点的服务端实现
///
/// 注册中心进程自身用它暴露健康状态，业务服务也可以直接嵌入。
/// 空服务名表示整个进程的状态。
#[derive(Debug, Clone, Default)]
pub struct HealthReporter {
    statuses: Arc<DashMap<String, ServingStatus>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        let reporter = Self::default();
        reporter.set_serving("");
        reporter
    }

    pub fn set_serving(&self, service_name: &str) {
        self.set_status(service_name, ServingStatus::Serving);
    }

    pub fn set_not_serving(&self, service_name: &str) {
        self.set_status(service_name, ServingStatus::NotServing);
    }

    fn set_status(&self, service_name: &str, status: ServingStatus) {
        let previous = self.statuses.insert(service_name.to_string(), status);
        if previous != Some(status) {
            tracing::info!(
                service_name = %service_name,
                status = status.as_str_name(),
                "Serving status changed"
            );
        }
    }
}

#[tonic::async_trait]
impl HealthService for HealthReporter {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let req = request.into_inner();
        let status = self
            .statuses
            .get(&req.service)
            .map(|entry| *entry.value())
            .ok_or_else(|| Status::not_found(format!("unknown service: {}", req.service)))?;

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }
}
