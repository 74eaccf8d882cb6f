use crate::error::{Result, TransferError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Source of memory-pressure readings in the range 0..=1
pub trait MemorySampler: Send + Sync {
    fn pressure(&self) -> f64;

    /// Called when a reclaim pass is requested
    fn on_reclaim(&self) {}
}

/// Process RSS measured against a budget (or total system memory)
pub struct SystemMemorySampler {
    system: Mutex<System>,
    pid: Pid,
    budget_bytes: Option<u64>,
}

impl SystemMemorySampler {
    pub fn new(budget_mb: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from(std::process::id() as usize),
            budget_bytes: budget_mb.map(|mb| mb * 1024 * 1024),
        }
    }
}

impl MemorySampler for SystemMemorySampler {
    fn pressure(&self) -> f64 {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(_) => return 0.0,
        };

        system.refresh_process(self.pid);
        let rss = match system.process(self.pid) {
            Some(process) => process.memory(),
            None => return 0.0,
        };

        let budget = match self.budget_bytes {
            Some(budget) => budget,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };

        if budget == 0 {
            0.0
        } else {
            (rss as f64 / budget as f64).clamp(0.0, 1.0)
        }
    }
}

/// Scriptable sampler: a current value, optional queued readings, and a value to fall to after a reclaim
#[derive(Default)]
pub struct ManualMemorySampler {
    current: Mutex<f64>,
    queued: Mutex<VecDeque<f64>>,
    after_reclaim: Mutex<Option<f64>>,
}

impl ManualMemorySampler {
    pub fn new(pressure: f64) -> Self {
        Self {
            current: Mutex::new(pressure),
            ..Default::default()
        }
    }

    /// Pressure drops to `pressure` once a reclaim pass runs
    pub fn with_reclaim_target(self, pressure: f64) -> Self {
        if let Ok(mut target) = self.after_reclaim.lock() {
            *target = Some(pressure);
        }
        self
    }

    pub fn set(&self, pressure: f64) {
        if let Ok(mut current) = self.current.lock() {
            *current = pressure;
        }
    }

    /// Readings returned one per call before falling back to the current value
    pub fn push_readings(&self, readings: impl IntoIterator<Item = f64>) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.extend(readings);
        }
    }
}

impl MemorySampler for ManualMemorySampler {
    fn pressure(&self) -> f64 {
        let next = self.queued.lock().ok().and_then(|mut q| q.pop_front());
        let mut current = match self.current.lock() {
            Ok(current) => current,
            Err(_) => return 0.0,
        };
        if let Some(value) = next {
            *current = value;
        }
        *current
    }

    fn on_reclaim(&self) {
        let target = self.after_reclaim.lock().ok().and_then(|t| *t);
        if let Some(value) = target {
            self.set(value);
        }
    }
}

/// Shared view of process memory pressure plus reclaim bookkeeping
#[derive(Clone)]
pub struct MemoryMonitor {
    sampler: Arc<dyn MemorySampler>,
    /// Last reading as f64 bits
    last_pressure: Arc<AtomicU64>,
    reclaim_count: Arc<AtomicU64>,
    /// Bytes of in-flight pages
    tracked_bytes: Arc<AtomicU64>,
    max_tracked_bytes: Option<u64>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MemoryMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            sampler,
            last_pressure: Arc::new(AtomicU64::new(0f64.to_bits())),
            reclaim_count: Arc::new(AtomicU64::new(0)),
            tracked_bytes: Arc::new(AtomicU64::new(0)),
            max_tracked_bytes: None,
            shutdown_tx: None,
        }
    }

    /// Monitor over the running process
    pub fn system(budget_mb: Option<u64>) -> Self {
        Self::new(Arc::new(SystemMemorySampler::new(budget_mb)))
    }

    /// Monitor reporting a fixed pressure
    pub fn fixed(pressure: f64) -> Self {
        Self::new(Arc::new(ManualMemorySampler::new(pressure)))
    }

    pub fn with_tracking_limit(mut self, max_bytes: u64) -> Self {
        self.max_tracked_bytes = Some(max_bytes);
        self
    }

    /// Take a fresh reading
    pub fn pressure(&self) -> f64 {
        let pressure = self.sampler.pressure().clamp(0.0, 1.0);
        self.last_pressure.store(pressure.to_bits(), Ordering::Relaxed);
        crate::metrics::update_memory_pressure(pressure);
        pressure
    }

    /// Most recent reading without sampling again
    pub fn last_pressure(&self) -> f64 {
        f64::from_bits(self.last_pressure.load(Ordering::Relaxed))
    }

    /// Request a reclaim pass: buffers owned by callers are expected to be dropped before this
    pub fn reclaim(&self, component: &str) {
        let count = self.reclaim_count.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::record_memory_reclaim(component);
        info!(
            component,
            pressure = self.last_pressure(),
            passes = count,
            "Memory reclaim pass requested"
        );
        self.sampler.on_reclaim();
    }

    pub fn reclaim_count(&self) -> u64 {
        self.reclaim_count.load(Ordering::SeqCst)
    }

    /// Account for a buffered page until the returned guard drops
    pub fn track(&self, size_bytes: u64) -> Result<MemoryAllocation> {
        let new_total = self.tracked_bytes.fetch_add(size_bytes, Ordering::SeqCst) + size_bytes;

        if let Some(max) = self.max_tracked_bytes {
            if new_total > max {
                self.tracked_bytes.fetch_sub(size_bytes, Ordering::SeqCst);
                return Err(TransferError::ResourceExhausted(format!(
                    "Buffered page memory limit exceeded: {} MB",
                    max / 1_048_576
                )));
            }
        }

        Ok(MemoryAllocation {
            tracked: self.tracked_bytes.clone(),
            size_bytes,
        })
    }

    pub fn tracked_bytes(&self) -> u64 {
        self.tracked_bytes.load(Ordering::SeqCst)
    }

    /// Start a background sampler that reports elevated pressure
    pub fn start_monitoring(
        &mut self,
        period: Duration,
        warn_pressure: f64,
    ) -> mpsc::Receiver<MemoryPressureEvent> {
        let (tx, rx) = mpsc::channel(10);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let monitor = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pressure = monitor.pressure();
                        debug!(pressure, tracked_bytes = monitor.tracked_bytes(), "Memory sample");

                        if pressure >= warn_pressure {
                            warn!("High memory pressure: {:.1}%", pressure * 100.0);
                            if tx.send(MemoryPressureEvent::Elevated(pressure)).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Memory monitor shutting down");
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Stop the memory monitor
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// RAII guard for tracked page memory
pub struct MemoryAllocation {
    tracked: Arc<AtomicU64>,
    size_bytes: u64,
}

impl Drop for MemoryAllocation {
    fn drop(&mut self) {
        self.tracked.fetch_sub(self.size_bytes, Ordering::SeqCst);
    }
}

/// Memory pressure events
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryPressureEvent {
    Elevated(f64),
}
