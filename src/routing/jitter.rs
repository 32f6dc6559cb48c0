//! Random delay applied before every `message_sent` acknowledgment.
//!
//! Acknowledgment latency must not reveal whether a target id exists, so
//! success and failure paths both wait for a uniformly drawn delay.

use std::time::Duration;

use rand::Rng;

use crate::config::RoutingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min_ms: u64,
    max_ms: u64,
}

impl Jitter {
    /// Bounds are reordered if given backwards.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.jitter_min_ms, config.jitter_max_ms)
    }

    /// Draw a delay in `[min, max]`.
    pub fn sample(&self) -> Duration {
        let ms = if self.min_ms == self.max_ms {
            self.min_ms
        } else {
            rand::thread_rng().gen_range(self.min_ms..=self.max_ms)
        };
        Duration::from_millis(ms)
    }

    pub async fn wait(&self) {
        tokio::time::sleep(self.sample()).await;
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_bounds() {
        let jitter = Jitter::default();
        for _ in 0..200 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(60), "{:?}", d);
        }
    }

    #[test]
    fn reversed_bounds_are_normalised() {
        let jitter = Jitter::new(50, 20);
        assert_eq!(jitter, Jitter::new(20, 50));
        assert_eq!(Jitter::new(7, 7).sample(), Duration::from_millis(7));
    }

    #[tokio::test]
    async fn wait_sleeps_at_least_the_minimum() {
        let start = std::time::Instant::now();
        Jitter::new(30, 30).wait().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
