mod load_balancer;
mod strategy;
mod types;

pub use load_balancer::{LoadBalancer, OutstandingGuard};
pub use types::{InstanceLoadStats, LoadBalancerConfig, LoadBalancerStrategy};
