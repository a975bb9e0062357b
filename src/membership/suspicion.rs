//! Confirmation-accelerated suspicion timer.
//!
//! A suspected node gets a timer that starts at the maximum timeout and
//! shrinks as independent peers confirm the suspicion:
//! `timeout(k) = max(min, max * (1 - ln(1+k)/ln(1+k_max)))`.
//! With zero expected confirmers (tiny clusters) the timer runs at `min`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Inner {
    confirmers: HashSet<String>,
    fired: bool,
}

pub struct Suspicion {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

fn remaining_timeout(confirmations: usize, k_max: u32, min: Duration, max: Duration) -> Duration {
    if k_max == 0 {
        return min;
    }
    let frac = ((1 + confirmations) as f64).ln() / ((1 + k_max as usize) as f64).ln();
    let secs = max.as_secs_f64() * (1.0 - frac);
    Duration::from_secs_f64(secs.max(min.as_secs_f64()))
}

impl Suspicion {
    /// Start the timer. `accuser` counts as the first confirmation.
    /// `on_timeout` runs with the final confirmation count if the timer
    /// expires before `stop`.
    pub fn new(
        accuser: &str,
        k_max: u32,
        min: Duration,
        max: Duration,
        on_timeout: impl FnOnce(usize) + Send + 'static,
    ) -> Self {
        let mut confirmers = HashSet::new();
        confirmers.insert(accuser.to_string());

        let inner = Arc::new(Mutex::new(Inner {
            confirmers,
            fired: false,
        }));
        let notify = Arc::new(Notify::new());

        let task_inner = inner.clone();
        let task_notify = notify.clone();
        let start = Instant::now();
        let handle = tokio::spawn(async move {
            let mut on_timeout = Some(on_timeout);
            loop {
                let (deadline, confirmations) = {
                    let guard = task_inner.lock().unwrap();
                    // The accuser seeded the set; acceleration counts the
                    // extra confirmers.
                    let extra = guard.confirmers.len().saturating_sub(1);
                    (start + remaining_timeout(extra, k_max, min, max), extra)
                };

                if Instant::now() >= deadline {
                    {
                        let mut guard = task_inner.lock().unwrap();
                        guard.fired = true;
                    }
                    if let Some(f) = on_timeout.take() {
                        f(confirmations);
                    }
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = task_notify.notified() => {}
                }
            }
        });

        Self {
            inner,
            notify,
            handle,
        }
    }

    /// Record an independent confirmation. Returns true when `from` is a new
    /// confirmer, i.e. the message is worth rebroadcasting.
    pub fn confirm(&self, from: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.fired {
            return false;
        }
        if !guard.confirmers.insert(from.to_string()) {
            return false;
        }
        drop(guard);
        self.notify.notify_one();
        true
    }
}

impl Drop for Suspicion {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timeout_shrinks_with_confirmations() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        let t0 = remaining_timeout(0, 3, min, max);
        let t1 = remaining_timeout(1, 3, min, max);
        let t3 = remaining_timeout(3, 3, min, max);

        assert_eq!(t0, max);
        assert!(t1 < t0);
        assert_eq!(t3, min);
    }

    #[test]
    fn test_zero_k_pins_to_min() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(remaining_timeout(0, 0, min, max), min);
        assert_eq!(remaining_timeout(5, 0, min, max), min);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_max_without_confirmations() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _s = Suspicion::new(
            "accuser",
            3,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmations_accelerate() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let s = Suspicion::new(
            "accuser",
            3,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            move |n| {
                assert_eq!(n, 3);
                f.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(s.confirm("a"));
        assert!(!s.confirm("a"), "duplicate confirmer must not count twice");
        assert!(s.confirm("b"));
        assert!(s.confirm("c"));

        // Fully confirmed: fires at the minimum timeout, well before max.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let s = Suspicion::new(
            "accuser",
            0,
            Duration::from_millis(100),
            Duration::from_millis(100),
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        drop(s);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
