use opizontas_discovery::{Config, server};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.server.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        listen_address = %config.server.listen_address,
        strategy = %config.discovery.load_balancer.strategy,
        "Starting discovery server..."
    );
    server::start(config).await?;
    Ok(())
}
