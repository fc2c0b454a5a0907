//! Client side of discovery: the in-process `DiscoveryClient` facade that
//! owns every component, and the remote `RegistrationClient` business
//! services use to register with a registry server.

pub mod config;
pub mod discovery;
pub mod error;
pub mod options;
pub mod registration;

pub use config::{ClientConfig, DiscoveryConfig, RegistrationClientConfig};
pub use discovery::DiscoveryClient;
pub use error::RegistrationClientError;
pub use options::InvokeOptions;
pub use registration::{Registration, RegistrationClient};
