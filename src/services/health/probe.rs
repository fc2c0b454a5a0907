use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tonic::Status;
use tonic::transport::Endpoint;

use crate::discovery::{
    HealthCheckRequest, health_check_response::ServingStatus,
    health_service_client::HealthServiceClient,
};
use crate::services::registry::ServiceInstance;

/// 探测错误类型
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),
    #[error("Connection failed: {0}")]
    Connection(#[from] std::io::Error),
    #[error("Instance reported not serving: {0}")]
    NotServing(String),
    #[error("Invalid health endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Instance has no health endpoint")]
    NoEndpoint,
}

/// 主动健康探测接口，超时由调用方控制
#[tonic::async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError>;
}

/// 按健康端点的协议选择探测方式
///
/// - `tcp://host:port`: 建立 TCP 连接即视为健康
/// - `http://` / `https://`: 调用 `HealthService.Check`，只有 SERVING 视为健康
#[derive(Debug, Clone)]
pub struct EndpointProbe {
    connect_timeout: Duration,
}

impl EndpointProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn probe_tcp(&self, target: &str) -> Result<(), ProbeError> {
        let stream = TcpStream::connect(target).await?;
        drop(stream);
        Ok(())
    }

    async fn probe_grpc(&self, endpoint: &str, service_name: &str) -> Result<(), ProbeError> {
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(self.connect_timeout)
            .timeout(self.connect_timeout)
            .connect()
            .await?;
        let mut client = HealthServiceClient::new(channel);
        let response = client
            .check(HealthCheckRequest {
                service: service_name.to_string(),
            })
            .await?
            .into_inner();

        match response.status() {
            ServingStatus::Serving => Ok(()),
            other => Err(ProbeError::NotServing(other.as_str_name().to_string())),
        }
    }
}

impl Default for EndpointProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[tonic::async_trait]
impl HealthProbe for EndpointProbe {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
        let endpoint = instance
            .health_endpoint
            .as_deref()
            .ok_or(ProbeError::NoEndpoint)?;

        if let Some(target) = endpoint.strip_prefix("tcp://") {
            self.probe_tcp(target).await
        } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            self.probe_grpc(endpoint, &instance.service_name).await
        } else {
            Err(ProbeError::InvalidEndpoint(endpoint.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::{Registry, ServiceRegistration};
    use tokio::net::TcpListener;

    fn instance_with_endpoint(endpoint: &str) -> ServiceInstance {
        let registry = Registry::default();
        let id = registry
            .register(ServiceRegistration::new("ai", "127.0.0.1:1").with_health_endpoint(endpoint))
            .unwrap();
        registry.get(&id).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let instance = instance_with_endpoint(&format!("tcp://{addr}"));

        let probe = EndpointProbe::default();
        assert!(probe.probe(&instance).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let instance = instance_with_endpoint(&format!("tcp://{addr}"));

        let probe = EndpointProbe::default();
        assert!(matches!(
            probe.probe(&instance).await,
            Err(ProbeError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let instance = instance_with_endpoint("udp://127.0.0.1:9");
        let probe = EndpointProbe::default();
        assert!(matches!(
            probe.probe(&instance).await,
            Err(ProbeError::InvalidEndpoint(_))
        ));
    }
}
