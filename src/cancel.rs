//! Shared stop signal for every unit of a load run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Monotonic, thread-safe stop flag.
///
/// Clones share the same flag. Once set it stays set; a fresh token is
/// created for every run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every unit sleeping on it. Repeated calls are no-ops.
    pub fn set(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            // Take the lock so a sleeper cannot miss the notification between
            // its flag check and its wait.
            let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.wake.notify_all();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, returning early once the token is set.
    ///
    /// Returns `true` if the token is set when the call returns.
    pub fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_set();
        }
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Number of live clones, mostly useful in tests to prove units let go of the token.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn starts_unset() {
        assert!(!CancellationToken::new().is_set());
    }

    #[test]
    fn set_is_idempotent() {
        let token = CancellationToken::new();
        token.set();
        token.set();
        assert!(token.is_set());
    }

    #[test]
    fn concurrent_setters_leave_it_set() {
        let token = CancellationToken::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = token.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        t.set();
                        assert!(t.is_set());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(token.is_set());
    }

    #[test]
    fn sleep_wakes_early_on_set() {
        let token = CancellationToken::new();
        let setter = token.clone();
        let start = Instant::now();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        h.join().unwrap();
    }

    #[test]
    fn sleep_runs_to_deadline_when_unset() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.sleep(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_zero_reports_state() {
        let token = CancellationToken::new();
        assert!(!token.sleep(Duration::ZERO));
        token.set();
        assert!(token.sleep(Duration::ZERO));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_number_of_setters_leaves_it_set(threads in 1usize..8, sets in 1usize..20) {
            let token = CancellationToken::new();
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let t = token.clone();
                    thread::spawn(move || {
                        for _ in 0..sets {
                            t.set();
                        }
                        t.is_set()
                    })
                })
                .collect();
            for h in handles {
                prop_assert!(h.join().unwrap());
            }
            prop_assert!(token.is_set());
            prop_assert!(token.sleep(Duration::from_secs(10)));
            prop_assert_eq!(token.holders(), 1);
        }

        #[test]
        fn unset_token_sleeps_full_duration(ms in 1u64..20) {
            let token = CancellationToken::new();
            let start = Instant::now();
            prop_assert!(!token.sleep(Duration::from_millis(ms)));
            prop_assert!(start.elapsed() >= Duration::from_millis(ms));
        }
    }
}
