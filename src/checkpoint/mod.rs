pub mod plan;
pub mod storage;
pub mod store;

pub use plan::{step_priority, PlanStatus, ResumePlan, ResumeStep, StepStatus};
pub use storage::{CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage};
pub use store::{CheckpointStatistics, CheckpointStore};
