use tonic::Status;

/// 注册客户端错误类型
#[derive(Debug, thiserror::Error)]
pub enum RegistrationClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),
    #[error("Registration rejected: {0}")]
    Rejected(String),
    #[error("Invalid registration client config: {0}")]
    InvalidConfig(String),
}
