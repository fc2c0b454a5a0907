//! Health checking: active probes, passive call-outcome signals and the
//! health endpoint served by instances.

pub mod checker;
pub mod grpc_impl;
pub mod probe;
pub mod types;

pub use checker::HealthChecker;
pub use grpc_impl::HealthReporter;
pub use probe::{EndpointProbe, HealthProbe, ProbeError};
pub use types::{HealthCheckConfig, HealthCheckResult};
