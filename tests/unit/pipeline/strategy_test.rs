// Strategy selection tests

use estransfer::config::{ThrottleConfig, TransferStrategy};
use estransfer::pipeline::select_strategy;

#[cfg(test)]
mod strategy_tests {
    use super::*;

    const HIGH: f64 = 0.7;

    #[test]
    fn test_small_index_streams() {
        assert_eq!(select_strategy(0, true, 0.1, HIGH), TransferStrategy::Streaming);
        assert_eq!(select_strategy(10_000_000, false, 0.95, HIGH), TransferStrategy::Streaming);
    }

    #[test]
    fn test_large_index_depends_on_pressure() {
        assert_eq!(select_strategy(10_000_001, true, 0.5, HIGH), TransferStrategy::Scroll);
        assert_eq!(select_strategy(50_000_000, true, 0.7, HIGH), TransferStrategy::Scroll);
        assert_eq!(select_strategy(50_000_000, true, 0.75, HIGH), TransferStrategy::Streaming);
    }

    #[test]
    fn test_default_cutoff_is_the_green_threshold() {
        let green = ThrottleConfig::default().green_threshold;
        assert_eq!(green, HIGH);
        assert_eq!(select_strategy(50_000_000, true, 0.72, green), TransferStrategy::Streaming);
    }

    #[test]
    fn test_very_large_index_depends_on_time_field() {
        assert_eq!(select_strategy(100_000_001, true, 0.95, HIGH), TransferStrategy::Pagination);
        assert_eq!(select_strategy(100_000_001, false, 0.1, HIGH), TransferStrategy::Hybrid);
        // Exactly at the boundary still counts as large
        assert_eq!(select_strategy(100_000_000, true, 0.1, HIGH), TransferStrategy::Scroll);
    }
}
