pub mod batch_writer;
pub mod memory_monitor;
pub mod orchestrator;
pub mod strategy;
pub mod throttle;
pub mod transformer;

pub use batch_writer::BatchWriter;
pub use memory_monitor::{
    ManualMemorySampler, MemoryAllocation, MemoryMonitor, MemoryPressureEvent, MemorySampler,
    SystemMemorySampler,
};
pub use orchestrator::{TransferOrchestrator, TransferTask, DEFAULT_ESTIMATE};
pub use strategy::select_strategy;
pub use throttle::{AdaptiveThrottleController, PressureBand, ThrottlePermit, ThrottleStats};
pub use transformer::DocumentTransformer;
