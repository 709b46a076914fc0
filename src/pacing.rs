use rand::RngExt;
use std::time::Duration;

use crate::config::BrowserSettings;

/// Human-like pauses between portal actions: a random draw from
/// `[min, max]` plus the fixed slow-motion delay.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    min: Duration,
    max: Duration,
    slow_mo: Duration,
}

impl Pacing {
    pub fn new(min: Duration, max: Duration, slow_mo: Duration) -> Self {
        let (min, max) = if min > max { (max, min) } else { (min, max) };
        Self { min, max, slow_mo }
    }

    pub fn from_settings(settings: &BrowserSettings) -> Self {
        Self::new(
            settings.min_action_delay,
            settings.max_action_delay,
            settings.slow_mo,
        )
    }

    pub fn next_delay(&self) -> Duration {
        let jitter = if self.max > self.min {
            let secs = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
            Duration::from_secs_f64(secs)
        } else {
            self.min
        };
        jitter + self.slow_mo
    }

    pub async fn pause(&self, step: &str) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }
        tracing::debug!(step, "Human pause of {:.2}s", delay.as_secs_f64());
        tokio::time::sleep(delay).await;
    }
}
