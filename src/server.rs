use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::transport::server::Router;

use crate::config::Config;
use crate::discovery::health_service_server::HealthServiceServer;
use crate::discovery::registry_service_server::RegistryServiceServer;
use crate::services::client::DiscoveryClient;
use crate::services::health::HealthReporter;
use crate::services::registry::RegistryGrpcService;

/// 注册中心在健康端点中使用的服务名
pub const REGISTRY_SERVICE_NAME: &str = "discovery.RegistryService";

/// 组装注册服务与健康服务
pub fn router(client: &DiscoveryClient, health: HealthReporter) -> Router {
    let registry_service = RegistryGrpcService::new(Arc::clone(client.registry()));
    health.set_serving(REGISTRY_SERVICE_NAME);

    Server::builder()
        .add_service(RegistryServiceServer::new(registry_service))
        .add_service(HealthServiceServer::new(health))
}

pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&config.server.listen_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Discovery server listening");

    serve(listener, config, shutdown_signal()).await
}

/// 在给定监听器上运行注册中心，`shutdown` 完成后停止服务和后台任务
pub async fn serve(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = DiscoveryClient::new(config.discovery)?;
    client.start();

    let health = HealthReporter::new();
    let result = router(&client, health.clone())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await;

    health.set_not_serving("");
    client.stop().await;
    result?;

    tracing::info!("Discovery server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
