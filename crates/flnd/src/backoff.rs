use std::time::Duration;

pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay between failed node starts: doubles per consecutive failure up to a
/// ceiling, back to the base after a success.
#[derive(Clone, Debug)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(RETRY_BASE_DELAY, RETRY_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling_and_resets() {
        let mut backoff = RetryBackoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
