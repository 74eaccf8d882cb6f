use serde::{Deserialize, Serialize};

mod checkpoint;
mod cluster;
mod engine;
mod loader;
mod logging;
mod throttle;
mod transfer;

pub use checkpoint::*;
pub use cluster::*;
pub use engine::*;
pub use loader::*;
pub use logging::*;
pub use throttle::*;
pub use transfer::*;

pub use crate::error::retry::RetryConfig;
pub use crate::recovery::CircuitBreakerConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Cluster documents are read from
    pub source: ClusterConfig,

    /// Cluster documents are written to
    pub target: ClusterConfig,

    /// What to move and how to reshape it
    pub transfer: TransferConfig,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub scroll: ScrollConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}
