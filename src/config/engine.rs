use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScrollConfig {
    /// Pressure above which a reclaim pass runs after a page
    #[serde(default = "default_reclaim_pressure")]
    pub reclaim_pressure: f64,

    #[serde(default = "default_reclaim_pause_ms")]
    pub reclaim_pause_ms: u64,

    /// Rounds between keep-alive refreshes of the server-side cursor
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u64,

    #[serde(default = "default_progress_every")]
    pub progress_log_every: u64,

    /// Pages larger than this get a short pause between fetches
    #[serde(default = "default_large_page")]
    pub large_page_threshold: usize,

    #[serde(default = "default_large_page_delay_ms")]
    pub large_page_delay_ms: u64,

    /// Multiplied by pressure to get the delay under high pressure
    #[serde(default = "default_pressure_delay_ms")]
    pub pressure_delay_ms: u64,
}

impl ScrollConfig {
    pub fn reclaim_pause(&self) -> Duration {
        Duration::from_millis(self.reclaim_pause_ms)
    }
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            reclaim_pressure: default_reclaim_pressure(),
            reclaim_pause_ms: default_reclaim_pause_ms(),
            refresh_every: default_refresh_every(),
            progress_log_every: default_progress_every(),
            large_page_threshold: default_large_page(),
            large_page_delay_ms: default_large_page_delay_ms(),
            pressure_delay_ms: default_pressure_delay_ms(),
        }
    }
}

fn default_reclaim_pressure() -> f64 {
    0.85
}
fn default_reclaim_pause_ms() -> u64 {
    1000
}
fn default_refresh_every() -> u64 {
    1000
}
fn default_progress_every() -> u64 {
    100
}
fn default_large_page() -> usize {
    5000
}
fn default_large_page_delay_ms() -> u64 {
    50
}
fn default_pressure_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    TimeBased,
    IdBased,
    /// Time-based when the time field exists, id-based otherwise
    Hybrid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaginationConfig {
    #[serde(default = "default_pagination_mode")]
    pub mode: PaginationMode,

    /// Clamped to 100..=10000
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_time_field")]
    pub time_field: String,

    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,

    /// Empty windows double up to this size
    #[serde(default = "default_max_window_minutes")]
    pub max_window_minutes: i64,

    /// Safety cap on search-after pages inside one window
    #[serde(default = "default_max_deep_pages")]
    pub max_deep_pages: u64,

    #[serde(default = "default_progress_every")]
    pub progress_log_every: u64,

    #[serde(default = "default_high_pressure")]
    pub high_pressure: f64,

    #[serde(default = "default_high_pressure_pause_ms")]
    pub high_pressure_pause_ms: u64,

    #[serde(default = "default_moderate_pressure")]
    pub moderate_pressure: f64,

    #[serde(default = "default_moderate_pressure_pause_ms")]
    pub moderate_pressure_pause_ms: u64,
}

impl PaginationConfig {
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(100, 10_000)
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            mode: default_pagination_mode(),
            page_size: default_page_size(),
            time_field: default_time_field(),
            window_minutes: default_window_minutes(),
            max_window_minutes: default_max_window_minutes(),
            max_deep_pages: default_max_deep_pages(),
            progress_log_every: default_progress_every(),
            high_pressure: default_high_pressure(),
            high_pressure_pause_ms: default_high_pressure_pause_ms(),
            moderate_pressure: default_moderate_pressure(),
            moderate_pressure_pause_ms: default_moderate_pressure_pause_ms(),
        }
    }
}

fn default_pagination_mode() -> PaginationMode {
    PaginationMode::Hybrid
}
fn default_page_size() -> usize {
    2000
}
fn default_time_field() -> String {
    "@timestamp".to_string()
}
fn default_window_minutes() -> i64 {
    10
}
fn default_max_window_minutes() -> i64 {
    60
}
fn default_max_deep_pages() -> u64 {
    1000
}
fn default_high_pressure() -> f64 {
    0.9
}
fn default_high_pressure_pause_ms() -> u64 {
    2000
}
fn default_moderate_pressure() -> f64 {
    0.8
}
fn default_moderate_pressure_pause_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Pressure above which the producer slows down and the monitor reclaims
    #[serde(default = "default_throttle_pressure")]
    pub throttle_pressure: f64,

    /// Pressure above which the producer stops fetching
    #[serde(default = "default_pause_pressure")]
    pub pause_pressure: f64,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_pause_sleep_ms")]
    pub pause_sleep_ms: u64,

    /// Settling time after a reclaim pass
    #[serde(default = "default_reclaim_settle_ms")]
    pub reclaim_settle_ms: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Multiplied by pressure to get the producer delay while throttled
    #[serde(default = "default_pressure_delay_ms")]
    pub pressure_delay_ms: u64,
}

impl StreamingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn pause_sleep(&self) -> Duration {
        Duration::from_millis(self.pause_sleep_ms)
    }

    pub fn reclaim_settle(&self) -> Duration {
        Duration::from_millis(self.reclaim_settle_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrent_batches: default_max_concurrent_batches(),
            throttle_pressure: default_throttle_pressure(),
            pause_pressure: default_pause_pressure(),
            poll_timeout_ms: default_poll_timeout_ms(),
            pause_sleep_ms: default_pause_sleep_ms(),
            reclaim_settle_ms: default_reclaim_settle_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            pressure_delay_ms: default_pressure_delay_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_max_concurrent_batches() -> usize {
    5
}
fn default_throttle_pressure() -> f64 {
    0.8
}
fn default_pause_pressure() -> f64 {
    0.9
}
fn default_poll_timeout_ms() -> u64 {
    1000
}
fn default_pause_sleep_ms() -> u64 {
    1000
}
fn default_reclaim_settle_ms() -> u64 {
    100
}
fn default_monitor_interval_ms() -> u64 {
    10_000
}
