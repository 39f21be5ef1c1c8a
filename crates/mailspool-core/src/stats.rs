//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a mailer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Session attempts started.
    pub attempts: u64,
    /// Sessions currently running (0 or 1).
    pub sessions_in_flight: u64,
    /// Messages acknowledged by the server.
    pub delivered: u64,
    /// Messages dropped because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    attempts: AtomicU64,
    in_flight: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            attempts: self.attempts.load(Ordering::Relaxed),
            sessions_in_flight: self.in_flight.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Counts an attempt; the returned guard marks it in flight until dropped.
    pub(crate) fn start_attempt(&self) -> InFlight<'_> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(self)
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight gauge, also when the attempt is cancelled.
pub(crate) struct InFlight<'a>(&'a Counters);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let counters = Counters::default();
        {
            let _guard = counters.start_attempt();
            assert_eq!(counters.snapshot().sessions_in_flight, 1);
        }
        let stats = counters.snapshot();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.sessions_in_flight, 0);
    }
}
