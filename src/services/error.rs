use std::time::Duration;

use tonic::Status;

/// 请求函数返回的业务错误，统一装箱
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 服务发现层错误类型
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid registration: {0}")]
    Registration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No healthy instance available for service: {service_name}")]
    NoHealthyInstance { service_name: String },

    #[error("Circuit open for instance {instance_id} of service {service_name}")]
    CircuitOpen {
        service_name: String,
        instance_id: String,
    },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request to instance {instance_id} failed: {source}")]
    Request {
        instance_id: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// 暂时没有可用容量，调用方可以降级或返回缓存结果
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NoHealthyInstance { .. } | DiscoveryError::CircuitOpen { .. }
        )
    }

    /// 调用到达了实例但失败（包括超时）
    pub fn is_call_failure(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Request { .. } | DiscoveryError::Timeout(_)
        )
    }
}

impl From<DiscoveryError> for Status {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Registration(msg) => Status::invalid_argument(msg),
            DiscoveryError::NotFound(msg) => Status::not_found(msg),
            DiscoveryError::NoHealthyInstance { .. } | DiscoveryError::CircuitOpen { .. } => {
                Status::unavailable(err.to_string())
            }
            DiscoveryError::Timeout(_) => Status::deadline_exceeded(err.to_string()),
            DiscoveryError::Request { .. } => Status::internal(err.to_string()),
            DiscoveryError::Config(msg) => Status::failed_precondition(msg),
        }
    }
}
