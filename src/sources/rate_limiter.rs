use std::time::{Duration, Instant};

/// Spaces out requests to a provider by a minimum interval.
#[derive(Default)]
pub struct RateLimiter {
    last: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: None,
            min_interval,
        }
    }

    /// How long a caller arriving at `now` has to wait.
    pub fn delay_at(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.min_interval.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub async fn wait(&mut self) {
        let delay = self.delay_at(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.last = Some(Instant::now());
    }
}
