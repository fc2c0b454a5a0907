pub mod discovery {
    tonic::include_proto!("discovery");
}
pub mod config;
pub mod server;
pub mod services;

pub use config::{Config, ConfigError};
pub use services::client::{DiscoveryClient, InvokeOptions};
pub use services::error::DiscoveryError;
