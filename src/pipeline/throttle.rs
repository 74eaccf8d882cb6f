use crate::config::{available_cpus, ThrottleConfig};
use crate::error::{Result, TransferError};
use crate::pipeline::MemoryMonitor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Memory-pressure band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureBand {
    Green,
    Yellow,
    Red,
    /// Between red and critical: heavy throttling
    Heavy,
    Critical,
}

#[derive(Debug)]
struct ThrottleState {
    max_concurrency: usize,
    batch_size: usize,
    max_queue_size: usize,
    last_pressure: f64,
    last_adaptation: Instant,
    total_processed: u64,
    total_processing_ms: u64,
    current_throughput: f64,
    forced_pauses: u64,
}

/// Issues permits for concurrent units of work and tunes batch size,
/// concurrency and queue depth from memory pressure and its trend
pub struct AdaptiveThrottleController {
    config: ThrottleConfig,
    memory: MemoryMonitor,
    semaphore: Arc<Semaphore>,
    queue_size: Arc<AtomicUsize>,
    state: RwLock<ThrottleState>,
}

impl AdaptiveThrottleController {
    pub fn new(config: ThrottleConfig, memory: MemoryMonitor) -> Self {
        let initial_pressure = memory.pressure();
        let concurrency = config
            .initial_concurrency
            .clamp(1, config.concurrency_ceiling().max(1));
        let state = ThrottleState {
            max_concurrency: concurrency,
            batch_size: config
                .initial_batch_size
                .clamp(config.min_batch_size, config.max_batch_size),
            max_queue_size: config.initial_queue_size,
            last_pressure: initial_pressure,
            last_adaptation: Instant::now(),
            total_processed: 0,
            total_processing_ms: 0,
            current_throughput: 0.0,
            forced_pauses: 0,
        };

        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            queue_size: Arc::new(AtomicUsize::new(0)),
            state: RwLock::new(state),
            config,
            memory,
        }
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    pub fn band(&self, pressure: f64) -> PressureBand {
        let c = &self.config;
        if pressure >= c.critical_threshold {
            PressureBand::Critical
        } else if pressure >= c.red_threshold {
            PressureBand::Heavy
        } else if pressure >= c.yellow_threshold {
            PressureBand::Red
        } else if pressure >= c.green_threshold {
            PressureBand::Yellow
        } else {
            PressureBand::Green
        }
    }

    /// Wait for capacity under the current pressure band and take a permit
    pub async fn acquire_permit(&self) -> Result<ThrottlePermit> {
        loop {
            let pressure = self.memory.pressure();

            match self.band(pressure) {
                PressureBand::Critical => {
                    self.emergency_pause(pressure).await;
                    continue;
                }
                PressureBand::Heavy => {
                    self.adjust_for_high_pressure(pressure).await;
                    sleep(Duration::from_millis(self.config.heavy_pause_ms)).await;
                }
                PressureBand::Red => {
                    self.adjust_for_high_pressure(pressure).await;
                    sleep(Duration::from_millis(self.config.red_pause_ms)).await;
                }
                PressureBand::Yellow => {
                    self.adjust_moderately(pressure).await;
                    sleep(Duration::from_millis(self.config.yellow_pause_ms)).await;
                }
                PressureBand::Green => {
                    self.adjust_for_low_pressure().await;
                }
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TransferError::Pipeline("throttle semaphore closed".to_string()))?;
            self.queue_size.fetch_add(1, Ordering::SeqCst);

            return Ok(ThrottlePermit {
                _permit: permit,
                pressure_at_acquire: pressure,
                started: Instant::now(),
                processed_docs: 0,
                queue_size: self.queue_size.clone(),
            });
        }
    }

    /// Fold a finished permit into throughput statistics and re-tune when due
    pub async fn release_permit(&self, permit: ThrottlePermit) {
        let elapsed = permit.started.elapsed();
        let processed = permit.processed_docs;
        drop(permit);

        let due = {
            let mut state = self.state.write().await;
            state.total_processed += processed;
            state.total_processing_ms += elapsed.as_millis() as u64;
            let secs = elapsed.as_secs_f64();
            if secs > 0.0 {
                state.current_throughput = processed as f64 / secs;
            }
            state.last_adaptation.elapsed() >= self.config.adapt_interval()
        };

        if due {
            self.adapt_parameters().await;
        }
    }

    /// Re-tune from the pressure trend since the previous adaptation
    pub async fn adapt_parameters(&self) {
        let pressure = self.memory.pressure();
        let trend = {
            let mut state = self.state.write().await;
            let trend = pressure - state.last_pressure;
            state.last_pressure = pressure;
            state.last_adaptation = Instant::now();
            trend
        };

        debug!(pressure, trend, "Adapting throttle parameters");

        if trend > self.config.trend_delta {
            info!(pressure, trend, "Memory pressure rising, throttling ahead of band change");
            self.adjust_for_high_pressure(pressure).await;
        } else if trend < -self.config.trend_delta && pressure < self.config.yellow_threshold {
            self.adjust_for_low_pressure().await;
        }
    }

    /// Batch size recommended for the current pressure; does not change state
    pub async fn adaptive_batch_size(&self) -> usize {
        let pressure = self.memory.pressure();
        let current = self.state.read().await.batch_size;
        self.batch_size_for(pressure, current)
    }

    fn batch_size_for(&self, pressure: f64, current: usize) -> usize {
        let c = &self.config;
        let size = match self.band(pressure) {
            PressureBand::Green => {
                if current < c.base_batch_size * 2 {
                    current * 2
                } else {
                    current
                }
            }
            PressureBand::Yellow => current / 2,
            _ => current / 4,
        };
        size.clamp(c.min_batch_size, c.max_batch_size)
    }

    /// True when producers should stop feeding work
    pub async fn should_pause(&self) -> bool {
        let pressure = self.memory.pressure();
        let max_queue = self.state.read().await.max_queue_size;
        pressure >= self.config.critical_threshold
            || self.queue_size.load(Ordering::SeqCst) > max_queue
    }

    pub fn recommended_concurrency(&self) -> usize {
        let pressure = self.memory.pressure();
        let cpus = available_cpus();
        if pressure > self.config.red_threshold {
            (cpus / 4).max(1)
        } else if pressure > self.config.yellow_threshold {
            (cpus / 2).max(2)
        } else {
            cpus
        }
    }

    pub async fn current_batch_size(&self) -> usize {
        self.state.read().await.batch_size
    }

    pub async fn max_concurrency(&self) -> usize {
        self.state.read().await.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> ThrottleStats {
        let state = self.state.read().await;
        ThrottleStats {
            memory_pressure: self.memory.last_pressure(),
            batch_size: state.batch_size,
            max_concurrency: state.max_concurrency,
            queue_size: self.queue_size.load(Ordering::SeqCst),
            max_queue_size: state.max_queue_size,
            total_processed: state.total_processed,
            total_processing_ms: state.total_processing_ms,
            current_throughput: state.current_throughput,
            forced_pauses: state.forced_pauses,
        }
    }

    async fn emergency_pause(&self, pressure: f64) {
        warn!(
            pressure,
            "Critical memory pressure, pausing permits and forcing reclaim"
        );
        {
            let mut state = self.state.write().await;
            state.forced_pauses += 1;
        }

        self.memory.reclaim("throttle");
        sleep(self.config.reclaim_pause()).await;

        {
            let mut state = self.state.write().await;
            let old = state.max_concurrency;
            state.max_concurrency = 1;
            state.batch_size = self.config.min_batch_size;
            state.max_queue_size = 5;
            self.resize_permits(old, 1);
            self.publish(&state);
        }
        crate::metrics::record_throttle_adjustment("emergency");

        sleep(self.config.critical_pause()).await;
    }

    async fn adjust_for_high_pressure(&self, pressure: f64) {
        let mut state = self.state.write().await;
        let old = state.max_concurrency;
        state.max_concurrency = (old / 2).max(1);
        state.batch_size = (state.batch_size / 2).max(self.config.min_batch_size);
        state.max_queue_size = (state.max_queue_size / 2).max(10);
        self.resize_permits(old, state.max_concurrency);
        self.publish(&state);
        crate::metrics::record_throttle_adjustment("down");

        debug!(
            pressure,
            concurrency = state.max_concurrency,
            batch_size = state.batch_size,
            queue = state.max_queue_size,
            "High pressure adjustment"
        );
    }

    async fn adjust_moderately(&self, pressure: f64) {
        let mut state = self.state.write().await;
        let old = state.max_concurrency;
        state.max_concurrency = (old * 3 / 4).max(2).min(old);
        let shrunk = (state.batch_size as f64 * 0.8) as usize;
        state.batch_size = shrunk.max(100).min(state.batch_size);
        self.resize_permits(old, state.max_concurrency);
        self.publish(&state);

        debug!(
            pressure,
            concurrency = state.max_concurrency,
            batch_size = state.batch_size,
            "Moderate pressure adjustment"
        );
    }

    async fn adjust_for_low_pressure(&self) {
        let mut state = self.state.write().await;
        let old = state.max_concurrency;
        let ceiling = self.config.concurrency_ceiling();
        let batch_ceiling = (self.config.base_batch_size * 2).min(self.config.max_batch_size);

        // Growth never shrinks a value that is already above its ceiling
        let grown = if old < ceiling { old + 1 } else { old };
        let batch = if state.batch_size < batch_ceiling {
            (state.batch_size + 100).min(batch_ceiling)
        } else {
            state.batch_size
        };
        let queue = if state.max_queue_size < self.config.max_queue_size {
            (state.max_queue_size + 10).min(self.config.max_queue_size)
        } else {
            state.max_queue_size
        };

        if grown == old && batch == state.batch_size && queue == state.max_queue_size {
            return;
        }

        state.max_concurrency = grown;
        state.batch_size = batch;
        state.max_queue_size = queue;
        self.resize_permits(old, grown);
        self.publish(&state);
        crate::metrics::record_throttle_adjustment("up");
    }

    fn publish(&self, state: &ThrottleState) {
        crate::metrics::update_throttle_parameters(
            state.batch_size,
            state.max_concurrency,
            state.max_queue_size,
        );
    }

    /// Grow or shrink the permit pool; shrinking waits for holders in the background
    fn resize_permits(&self, old: usize, new: usize) {
        if new > old {
            self.semaphore.add_permits(new - old);
        } else if new < old {
            let delta = (old - new) as u32;
            match self.semaphore.clone().try_acquire_many_owned(delta) {
                Ok(permits) => permits.forget(),
                Err(_) => {
                    let semaphore = self.semaphore.clone();
                    tokio::spawn(async move {
                        if let Ok(permits) = semaphore.acquire_many_owned(delta).await {
                            permits.forget();
                        }
                    });
                }
            }
        }
    }
}

/// Gate for one unit of concurrent work; returned to the controller when the work ends
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
    pressure_at_acquire: f64,
    started: Instant,
    processed_docs: u64,
    queue_size: Arc<AtomicUsize>,
}

impl ThrottlePermit {
    pub fn pressure_at_acquire(&self) -> f64 {
        self.pressure_at_acquire
    }

    pub fn update_processed_docs(&mut self, count: u64) {
        self.processed_docs += count;
    }

    pub fn processed_docs(&self) -> u64 {
        self.processed_docs
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.queue_size.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleStats {
    pub memory_pressure: f64,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub total_processed: u64,
    pub total_processing_ms: u64,
    pub current_throughput: f64,
    pub forced_pauses: u64,
}

impl ThrottleStats {
    /// Milliseconds per document
    pub fn average_processing_time(&self) -> f64 {
        if self.total_processed > 0 {
            self.total_processing_ms as f64 / self.total_processed as f64
        } else {
            0.0
        }
    }

    /// Documents per second
    pub fn processing_speed(&self) -> f64 {
        if self.total_processing_ms > 0 {
            self.total_processed as f64 / self.total_processing_ms as f64 * 1000.0
        } else {
            0.0
        }
    }
}
