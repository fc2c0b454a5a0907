pub mod balancer;
pub mod circuit;
pub mod client;
pub mod error;
pub mod health;
pub mod outcome;
pub mod registry;

pub use client::{DiscoveryClient, DiscoveryConfig, InvokeOptions};
pub use error::{BoxError, DiscoveryError};
pub use outcome::CallOutcome;
pub use registry::{Registry, ServiceInstance, ServiceRegistration};
