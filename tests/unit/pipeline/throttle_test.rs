// Adaptive throttle controller tests

use crate::unit::support::fast_throttle_config;
use estransfer::config::ThrottleConfig;
use estransfer::pipeline::{
    AdaptiveThrottleController, ManualMemorySampler, MemoryMonitor, PressureBand, ThrottleStats,
};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod throttle_tests {
    use super::*;

    /// Ten permits to start with and room to grow
    fn config() -> ThrottleConfig {
        ThrottleConfig {
            max_concurrency: 16,
            ..fast_throttle_config()
        }
    }

    fn controller(config: ThrottleConfig, pressure: f64) -> (AdaptiveThrottleController, Arc<ManualMemorySampler>) {
        let sampler = Arc::new(ManualMemorySampler::new(pressure));
        let controller = AdaptiveThrottleController::new(config, MemoryMonitor::new(sampler.clone()));
        (controller, sampler)
    }

    #[tokio::test]
    async fn test_pressure_bands() {
        let (throttle, _) = controller(config(), 0.1);

        assert_eq!(throttle.band(0.5), PressureBand::Green);
        assert_eq!(throttle.band(0.7), PressureBand::Yellow);
        assert_eq!(throttle.band(0.8), PressureBand::Red);
        assert_eq!(throttle.band(0.9), PressureBand::Heavy);
        assert_eq!(throttle.band(0.95), PressureBand::Critical);
        assert_eq!(throttle.band(1.0), PressureBand::Critical);
    }

    #[tokio::test]
    async fn test_low_pressure_grows_to_ceiling() {
        let (throttle, _) = controller(
            ThrottleConfig {
                initial_concurrency: 2,
                max_concurrency: 4,
                ..fast_throttle_config()
            },
            0.1,
        );

        for _ in 0..3 {
            let mut permit = throttle.acquire_permit().await.unwrap();
            permit.update_processed_docs(10);
            throttle.release_permit(permit).await;
        }

        assert_eq!(throttle.max_concurrency().await, 4);
        assert_eq!(throttle.current_batch_size().await, 1300);

        let stats = throttle.stats().await;
        assert_eq!(stats.max_queue_size, 130);
        assert_eq!(stats.total_processed, 30);
        assert_eq!(stats.queue_size, 0);
    }

    #[tokio::test]
    async fn test_red_band_halves_parameters() {
        let (throttle, _) = controller(config(), 0.85);

        let permit = throttle.acquire_permit().await.unwrap();
        assert_eq!(permit.pressure_at_acquire(), 0.85);
        throttle.release_permit(permit).await;

        assert_eq!(throttle.max_concurrency().await, 5);
        assert_eq!(throttle.current_batch_size().await, 500);
        assert_eq!(throttle.stats().await.max_queue_size, 50);
    }

    #[tokio::test]
    async fn test_yellow_band_trims_gently() {
        let (throttle, _) = controller(config(), 0.75);

        let permit = throttle.acquire_permit().await.unwrap();
        throttle.release_permit(permit).await;

        assert_eq!(throttle.max_concurrency().await, 7);
        assert_eq!(throttle.current_batch_size().await, 800);
    }

    #[tokio::test]
    async fn test_batch_size_never_drops_below_minimum() {
        let (throttle, _) = controller(
            ThrottleConfig {
                initial_batch_size: 60,
                ..config()
            },
            0.92,
        );

        for _ in 0..3 {
            let permit = throttle.acquire_permit().await.unwrap();
            throttle.release_permit(permit).await;
        }

        assert_eq!(throttle.current_batch_size().await, 50);
        assert_eq!(throttle.max_concurrency().await, 1);
        assert_eq!(throttle.stats().await.max_queue_size, 12);
    }

    #[tokio::test]
    async fn test_critical_pressure_forces_pause_and_reclaim() {
        let sampler = Arc::new(ManualMemorySampler::new(0.97).with_reclaim_target(0.3));
        let memory = MemoryMonitor::new(sampler.clone());
        let throttle = AdaptiveThrottleController::new(config(), memory.clone());

        let permit = throttle.acquire_permit().await.unwrap();

        // The loop re-reads after the pause and sees the reclaimed pressure
        assert_eq!(permit.pressure_at_acquire(), 0.3);
        assert_eq!(memory.reclaim_count(), 1);

        let stats = throttle.stats().await;
        assert_eq!(stats.forced_pauses, 1);
        // Emergency floor, then one green step
        assert_eq!(stats.max_concurrency, 2);
        assert_eq!(stats.batch_size, 150);
        assert_eq!(stats.max_queue_size, 15);

        throttle.release_permit(permit).await;
    }

    #[tokio::test]
    async fn test_rising_trend_throttles_before_band_change() {
        let (throttle, sampler) = controller(config(), 0.1);

        sampler.set(0.75);
        throttle.adapt_parameters().await;
        assert_eq!(throttle.max_concurrency().await, 5);
        assert_eq!(throttle.current_batch_size().await, 500);

        sampler.set(0.1);
        throttle.adapt_parameters().await;
        assert_eq!(throttle.max_concurrency().await, 6);
        assert_eq!(throttle.current_batch_size().await, 600);

        // A flat trend changes nothing
        throttle.adapt_parameters().await;
        assert_eq!(throttle.max_concurrency().await, 6);
    }

    #[tokio::test]
    async fn test_release_adapts_when_interval_elapsed() {
        let (throttle, sampler) = controller(
            ThrottleConfig {
                adapt_interval_ms: 0,
                ..config()
            },
            0.1,
        );

        let permit = throttle.acquire_permit().await.unwrap();
        assert_eq!(throttle.max_concurrency().await, 11);

        sampler.set(0.5);
        throttle.release_permit(permit).await;

        assert_eq!(throttle.max_concurrency().await, 5);
        assert_eq!(throttle.current_batch_size().await, 550);
    }

    #[tokio::test]
    async fn test_adaptive_batch_size_shrinks_with_pressure() {
        let (throttle, sampler) = controller(config(), 0.1);

        let mut sizes = Vec::new();
        for pressure in [0.1, 0.75, 0.85, 0.97] {
            sampler.set(pressure);
            sizes.push(throttle.adaptive_batch_size().await);
        }

        assert_eq!(sizes, vec![2000, 500, 250, 250]);
        assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        // Recommendation only
        assert_eq!(throttle.current_batch_size().await, 1000);
    }

    #[tokio::test]
    async fn test_should_pause() {
        let (throttle, sampler) = controller(config(), 0.5);
        assert!(!throttle.should_pause().await);

        sampler.set(0.96);
        assert!(throttle.should_pause().await);
    }

    #[tokio::test]
    async fn test_recommended_concurrency_drops_under_pressure() {
        let (throttle, sampler) = controller(config(), 0.1);
        let relaxed = throttle.recommended_concurrency();

        sampler.set(0.95);
        let strained = throttle.recommended_concurrency();

        assert!(strained >= 1);
        assert!(strained <= relaxed);
    }

    #[tokio::test]
    async fn test_permits_limit_concurrency() {
        let (throttle, _) = controller(
            ThrottleConfig {
                initial_concurrency: 2,
                max_concurrency: 2,
                ..fast_throttle_config()
            },
            0.1,
        );

        let first = throttle.acquire_permit().await.unwrap();
        let _second = throttle.acquire_permit().await.unwrap();
        assert_eq!(throttle.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(20), throttle.acquire_permit()).await;
        assert!(blocked.is_err());

        throttle.release_permit(first).await;
        let third = tokio::time::timeout(Duration::from_millis(200), throttle.acquire_permit()).await;
        assert!(third.is_ok());
    }

    #[test]
    fn test_stats_rates() {
        let stats = ThrottleStats {
            memory_pressure: 0.2,
            batch_size: 1000,
            max_concurrency: 4,
            queue_size: 0,
            max_queue_size: 100,
            total_processed: 500,
            total_processing_ms: 250,
            current_throughput: 0.0,
            forced_pauses: 0,
        };
        assert_eq!(stats.average_processing_time(), 0.5);
        assert_eq!(stats.processing_speed(), 2000.0);

        let idle = ThrottleStats {
            total_processed: 0,
            total_processing_ms: 0,
            ..stats
        };
        assert_eq!(idle.average_processing_time(), 0.0);
        assert_eq!(idle.processing_speed(), 0.0);
    }
}
