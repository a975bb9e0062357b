//! Lamport clocks.
//!
//! Three logical clocks drive the cluster layer: the member clock (join/leave
//! intents), the event clock (user events), and the query clock. Each is an
//! atomic counter whose only mutators are `increment` and `witness`.

use crate::types::LamportTime;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

impl LamportClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Current clock value.
    pub fn time(&self) -> LamportTime {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance the clock by one tick and return the new value.
    pub fn increment(&self) -> LamportTime {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Observe a remote time: the clock becomes `max(local, seen) + 1`.
    /// The clock never moves backwards.
    pub fn witness(&self, seen: LamportTime) {
        let mut cur = self.0.load(Ordering::SeqCst);
        loop {
            if seen < cur {
                return;
            }
            match self
                .0
                .compare_exchange_weak(cur, seen + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment() {
        let c = LamportClock::new();
        assert_eq!(c.time(), 0);
        assert_eq!(c.increment(), 1);
        assert_eq!(c.increment(), 2);
        assert_eq!(c.time(), 2);
    }

    #[test]
    fn test_witness_advances_past_seen() {
        let c = LamportClock::new();
        c.witness(41);
        assert_eq!(c.time(), 42);

        // A stale observation never rewinds the clock.
        c.witness(10);
        assert_eq!(c.time(), 42);

        // An equal observation still ticks forward.
        c.witness(42);
        assert_eq!(c.time(), 43);
    }

    #[test]
    fn test_witness_concurrent() {
        let c = std::sync::Arc::new(LamportClock::new());
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for t in 0..1000u64 {
                    c.witness(i * 1000 + t);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(c.time() >= 8000);
    }
}
