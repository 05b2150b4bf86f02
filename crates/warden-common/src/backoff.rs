use std::time::{Duration, Instant};

/// Exponential-with-ceiling backoff driver used by find/ask/tell retries.
/// Doubles the wait on every step up to `max_interval`, and reports
/// exhaustion once `duration` has elapsed since the first attempt.
pub struct Backoff {
    initial_interval: Duration,
    max_interval: Duration,
    deadline: Instant,
    next_interval: Duration,
}

impl Backoff {
    pub fn new(initial_interval: Duration, max_interval: Duration, duration: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            deadline: Instant::now() + duration,
            next_interval: initial_interval,
        }
    }

    /// Returns the wait to sleep before the next attempt, or `None` if the
    /// overall retry budget is exhausted.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline {
            return None;
        }
        let wait = self.next_interval;
        self.next_interval = (self.next_interval * 2).min(self.max_interval);
        Some(wait)
    }

    pub fn reset(&mut self) {
        self.next_interval = self.initial_interval;
    }

    pub fn is_exhausted(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(35),
            Duration::from_secs(10),
        );
        assert_eq!(backoff.next_wait(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_wait(), Some(Duration::from_millis(20)));
        // 40ms would exceed the 35ms ceiling.
        assert_eq!(backoff.next_wait(), Some(Duration::from_millis(35)));
        assert_eq!(backoff.next_wait(), Some(Duration::from_millis(35)));
    }

    #[test]
    fn exhausts_after_duration_elapses() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        std::thread::sleep(Duration::from_millis(10));
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_wait(), None);
    }

    #[test]
    fn reset_returns_to_initial_interval() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        backoff.next_wait();
        backoff.next_wait();
        backoff.reset();
        assert_eq!(backoff.next_wait(), Some(Duration::from_millis(10)));
    }
}
