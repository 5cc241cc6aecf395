use std::time::Duration;

use skillflow_core::config::RetryConfig;

/// Delay before the attempt following `attempt` (0-based).
///
/// Doubles from `initial_backoff_ms`, capped at `max_backoff_ms`, then
/// spread by `jitter` in both directions.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .initial_backoff_ms
        .saturating_mul(factor)
        .min(config.max_backoff_ms);
    let jitter = config.jitter.clamp(0.0, 1.0);
    // 0.2 gives 0.8x to 1.2x
    let scale = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
    Duration::from_millis((ms as f64 * scale) as u64)
}
