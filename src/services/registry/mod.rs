//! Registry module
//!
//! Authoritative in-memory instance registry, split into logical components:
//! - `types`: Data structures and configuration
//! - `service`: Core registry logic (register/deregister/heartbeat/list, expiry sweep)
//! - `events`: Broadcast of registry changes
//! - `grpc_impl`: gRPC trait implementation used by remote business services

pub mod events;
pub mod grpc_impl;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use events::RegistryEvent;
pub use grpc_impl::RegistryGrpcService;
pub use service::{Registry, ServiceInstances, ServiceRegistry};
pub use types::{
    HealthState, HealthUpdate, InstanceMetadata, RegistryConfig, ServiceHealthSummary,
    ServiceInstance, ServiceRegistration,
};
