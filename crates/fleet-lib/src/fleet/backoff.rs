//! Fibonacci backoff between failed reconciliation rounds

use std::time::Duration;

/// The `n`th Fibonacci number, saturating at `u64::MAX`
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Extra delay after consecutive failed rounds.
///
/// After `n` failures the delay is `fibonacci(n)` seconds, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    failures: u32,
    max: Duration,
}

impl FibonacciBackoff {
    pub fn new(max: Duration) -> Self {
        Self { failures: 0, max }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(fibonacci(self.failures)).min(self.max)
    }

    /// Count a failed round and return the new delay
    pub fn record_failure(&mut self) -> Duration {
        // Stop counting once the cap is reached
        if self.delay() < self.max {
            self.failures = self.failures.saturating_add(1);
        }
        self.delay()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
