mod breaker;
mod types;

pub use breaker::{CallPermit, CircuitBreaker};
pub use types::{CircuitBreakerConfig, CircuitKey, CircuitSnapshot, CircuitState, CircuitStats};
