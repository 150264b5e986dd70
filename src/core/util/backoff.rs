use std::time::Duration;

use rand::Rng;

/// Exponential backoff with 0.5x-1.5x jitter, used to re-establish watches.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt. Grows until `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);

        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_stays_within_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(100) && second <= Duration::from_millis(300));

        // capped at max * 1.5
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(600));
        }
        assert_eq!(backoff.attempts(), 12);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }
}
