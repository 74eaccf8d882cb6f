pub mod circuit_breaker;
pub mod engine;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats, CircuitState,
};
pub use engine::{RecoveryEngine, RecoveryResult, MAX_RECOVERY_BATCH};
