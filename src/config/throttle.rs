use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Memory-pressure bands and tuning bounds for the adaptive throttle
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleConfig {
    /// Below this pressure the controller may grow
    #[serde(default = "default_green")]
    pub green_threshold: f64,

    /// Upper bound of the yellow band
    #[serde(default = "default_yellow")]
    pub yellow_threshold: f64,

    /// Upper bound of the red band; above it heavy throttling applies
    #[serde(default = "default_red")]
    pub red_threshold: f64,

    /// At or above this pressure permits wait behind a forced reclaim pause
    #[serde(default = "default_critical")]
    pub critical_threshold: f64,

    #[serde(default = "default_max_concurrency")]
    pub initial_concurrency: usize,

    /// Hard ceiling for concurrency growth; 0 means twice the CPU count
    #[serde(default)]
    pub max_concurrency: usize,

    #[serde(default = "default_batch_size")]
    pub initial_batch_size: usize,

    /// Reference size the batch may grow to twice of
    #[serde(default = "default_batch_size")]
    pub base_batch_size: usize,

    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_queue_size")]
    pub initial_queue_size: usize,

    #[serde(default = "default_queue_ceiling")]
    pub max_queue_size: usize,

    /// Trend re-tuning period
    #[serde(default = "default_adapt_interval_ms")]
    pub adapt_interval_ms: u64,

    /// Pressure delta per period treated as a trend
    #[serde(default = "default_trend_delta")]
    pub trend_delta: f64,

    #[serde(default = "default_critical_pause_ms")]
    pub critical_pause_ms: u64,

    #[serde(default = "default_reclaim_pause_ms")]
    pub reclaim_pause_ms: u64,

    #[serde(default = "default_heavy_pause_ms")]
    pub heavy_pause_ms: u64,

    #[serde(default = "default_red_pause_ms")]
    pub red_pause_ms: u64,

    #[serde(default = "default_yellow_pause_ms")]
    pub yellow_pause_ms: u64,
}

impl ThrottleConfig {
    pub fn critical_pause(&self) -> Duration {
        Duration::from_millis(self.critical_pause_ms)
    }

    pub fn reclaim_pause(&self) -> Duration {
        Duration::from_millis(self.reclaim_pause_ms)
    }

    pub fn adapt_interval(&self) -> Duration {
        Duration::from_millis(self.adapt_interval_ms)
    }

    /// Effective concurrency ceiling
    pub fn concurrency_ceiling(&self) -> usize {
        if self.max_concurrency > 0 {
            self.max_concurrency
        } else {
            available_cpus() * 2
        }
    }
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            green_threshold: default_green(),
            yellow_threshold: default_yellow(),
            red_threshold: default_red(),
            critical_threshold: default_critical(),
            initial_concurrency: default_max_concurrency(),
            max_concurrency: 0,
            initial_batch_size: default_batch_size(),
            base_batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            initial_queue_size: default_queue_size(),
            max_queue_size: default_queue_ceiling(),
            adapt_interval_ms: default_adapt_interval_ms(),
            trend_delta: default_trend_delta(),
            critical_pause_ms: default_critical_pause_ms(),
            reclaim_pause_ms: default_reclaim_pause_ms(),
            heavy_pause_ms: default_heavy_pause_ms(),
            red_pause_ms: default_red_pause_ms(),
            yellow_pause_ms: default_yellow_pause_ms(),
        }
    }
}

fn default_green() -> f64 {
    0.7
}
fn default_yellow() -> f64 {
    0.8
}
fn default_red() -> f64 {
    0.9
}
fn default_critical() -> f64 {
    0.95
}
fn default_max_concurrency() -> usize {
    10
}
fn default_batch_size() -> usize {
    1000
}
fn default_min_batch_size() -> usize {
    50
}
fn default_max_batch_size() -> usize {
    5000
}
fn default_queue_size() -> usize {
    100
}
fn default_queue_ceiling() -> usize {
    200
}
fn default_adapt_interval_ms() -> u64 {
    10_000
}
fn default_trend_delta() -> f64 {
    0.05
}
fn default_critical_pause_ms() -> u64 {
    5000
}
fn default_reclaim_pause_ms() -> u64 {
    2000
}
fn default_heavy_pause_ms() -> u64 {
    1000
}
fn default_red_pause_ms() -> u64 {
    500
}
fn default_yellow_pause_ms() -> u64 {
    100
}

/// Where memory pressure readings come from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Process memory budget in MB; pressure = RSS / budget. Falls back to total system memory.
    #[serde(default)]
    pub budget_mb: Option<u64>,

    /// Background sampling period
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Pressure at which the monitor emits a warning event
    #[serde(default = "default_warn_pressure")]
    pub warn_pressure: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_mb: None,
            monitor_interval_ms: default_monitor_interval_ms(),
            warn_pressure: default_warn_pressure(),
        }
    }
}

fn default_monitor_interval_ms() -> u64 {
    1000
}
fn default_warn_pressure() -> f64 {
    0.85
}
