pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;
pub mod retry;

pub use circuit_breaker::{BreakerCheck, BreakerConfig, BreakerStateKind, CircuitBreakerRegistry};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot};
pub use loadbalance::RouteCursor;
pub use retry::RetryPolicy;
