//! Randomized pacing between outbound sends.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use tracing::trace;

use crate::config::ThrottleConfig;

#[derive(Debug, Clone)]
pub struct Throttler {
    config: ThrottleConfig,
}

impl Throttler {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Pause between two recipients of the same broadcast.
    pub async fn after_recipient(&self) {
        pause(jitter(&self.config.per_recipient)).await;
    }

    /// Pause between two messages of a pass.
    pub async fn after_message(&self) {
        pause(jitter(&self.config.per_message)).await;
    }
}

/// Uniform pick from a seconds range. Empty or inverted ranges yield their
/// lower bound.
fn jitter(range: &RangeInclusive<f64>) -> Duration {
    let (low, high) = (range.start().max(0.0), range.end().max(0.0));
    let secs = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    };
    Duration::from_secs_f64(secs)
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    trace!(delay_ms = delay.as_millis() as u64, "Throttling");
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..200 {
            let d = jitter(&(1.0..=3.0));
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn degenerate_ranges() {
        assert_eq!(jitter(&(0.0..=0.0)), Duration::ZERO);
        assert_eq!(jitter(&(2.0..=2.0)), Duration::from_secs(2));
        assert_eq!(jitter(&(-5.0..=-1.0)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_follow_config() {
        let throttler = Throttler::new(&ThrottleConfig {
            per_recipient: 2.0..=2.0,
            per_message: 0.0..=0.0,
        });
        let start = tokio::time::Instant::now();
        throttler.after_recipient().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2));
        throttler.after_message().await;
        assert_eq!(start.elapsed(), waited);
    }
}
