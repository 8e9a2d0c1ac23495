//! What to do when a file lock cannot be taken right away.

use std::thread;
use std::time::Duration;

/// Decides whether a blocked lock request is retried.
pub trait BusyHandler: Send {
    /// Called with the number of previous attempts; returning false gives
    /// up and surfaces [`crate::Error::Busy`].
    fn on_busy(&mut self, attempts: u32) -> bool;
}

impl<F> BusyHandler for F
where
    F: FnMut(u32) -> bool + Send,
{
    fn on_busy(&mut self, attempts: u32) -> bool {
        self(attempts)
    }
}

/// Never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl BusyHandler for NoRetry {
    fn on_busy(&mut self, _attempts: u32) -> bool {
        false
    }
}

/// Milliseconds to sleep before each retry; the last entry repeats.
const DELAYS_MS: [u64; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];

/// Sleeps with a growing delay until `timeout` has been spent waiting.
#[derive(Debug, Clone, Copy)]
pub struct RetryBusyHandler {
    timeout: Duration,
}

impl RetryBusyHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn waited_before(attempts: u32) -> Duration {
        let attempts = attempts as usize;
        let ms: u64 = if attempts < DELAYS_MS.len() {
            DELAYS_MS[..attempts].iter().sum()
        } else {
            let total: u64 = DELAYS_MS.iter().sum();
            total + (attempts - DELAYS_MS.len()) as u64 * DELAYS_MS[DELAYS_MS.len() - 1]
        };
        Duration::from_millis(ms)
    }
}

impl BusyHandler for RetryBusyHandler {
    fn on_busy(&mut self, attempts: u32) -> bool {
        let waited = Self::waited_before(attempts);
        if waited >= self.timeout {
            return false;
        }
        let next = Duration::from_millis(
            DELAYS_MS[(attempts as usize).min(DELAYS_MS.len() - 1)],
        );
        thread::sleep(next.min(self.timeout - waited));
        true
    }
}

/// Handler for an optional timeout.
pub fn for_timeout(timeout: Option<Duration>) -> Box<dyn BusyHandler> {
    match timeout {
        Some(t) if !t.is_zero() => Box::new(RetryBusyHandler::new(t)),
        _ => Box::new(NoRetry),
    }
}
