use crate::config::TransferStrategy;

/// Above this many documents an index counts as very large
pub const VERY_LARGE_INDEX: u64 = 100_000_000;
/// Above this many documents an index counts as large
pub const LARGE_INDEX: u64 = 10_000_000;

/// One-shot strategy choice from volume, time-field availability and memory pressure.
///
/// Large indexes stream instead of scrolling once pressure leaves the green band, so
/// `high_pressure` is the throttle's green threshold.
pub fn select_strategy(
    estimated_docs: u64,
    has_time_field: bool,
    pressure: f64,
    high_pressure: f64,
) -> TransferStrategy {
    if estimated_docs > VERY_LARGE_INDEX {
        if has_time_field {
            TransferStrategy::Pagination
        } else {
            TransferStrategy::Hybrid
        }
    } else if estimated_docs > LARGE_INDEX {
        if pressure > high_pressure {
            TransferStrategy::Streaming
        } else {
            TransferStrategy::Scroll
        }
    } else {
        TransferStrategy::Streaming
    }
}
