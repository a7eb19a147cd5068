use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Guards the prediction store: after `threshold` consecutive failures the
// store is bypassed for `cooldown`. Once the cooldown ends a single trial call
// is let through; its failure reopens the breaker, its success closes it.
pub struct StoreBreaker {
    threshold: u32,
    cooldown: Duration,
    started: Instant,
    failures: AtomicU32,
    // millis since `started` until which the breaker is open, 0 = closed.
    // A non-zero value in the past means half-open.
    open_until: AtomicU64,
}

impl StoreBreaker {
    // A threshold of 0 never opens
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            started: Instant::now(),
            failures: AtomicU32::new(0),
            open_until: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    // +1 keeps a zero-length window distinguishable from "closed"
    fn next_window(&self) -> u64 {
        self.now_ms() + self.cooldown.as_millis() as u64 + 1
    }

    pub fn is_open(&self) -> bool {
        let until = self.open_until.load(Ordering::Relaxed);
        until != 0 && self.now_ms() < until
    }

    /// Whether a store call may go ahead. In the half-open state only the
    /// caller that wins the swap gets through; the window is re-armed so
    /// everyone else keeps bypassing until that call reports back.
    pub fn allow_request(&self) -> bool {
        let until = self.open_until.load(Ordering::Relaxed);
        if until == 0 {
            return true;
        }
        if self.now_ms() < until {
            return false;
        }
        self.open_until
            .compare_exchange(until, self.next_window(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        if self.open_until.swap(0, Ordering::Relaxed) != 0 {
            tracing::info!("prediction store recovered, breaker closed");
        }
    }

    pub fn record_failure(&self) {
        if self.threshold == 0 {
            return;
        }

        // a failed trial call goes straight back to open
        if self.open_until.load(Ordering::Relaxed) != 0 {
            self.open_until.store(self.next_window(), Ordering::Relaxed);
            tracing::warn!(cooldown = ?self.cooldown, "prediction store still failing, breaker reopened");
            return;
        }

        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            self.failures.store(0, Ordering::Relaxed);
            self.open_until.store(self.next_window(), Ordering::Relaxed);
            tracing::warn!(
                failures,
                cooldown = ?self.cooldown,
                "prediction store failing, bypassing it"
            );
        }
    }
}
