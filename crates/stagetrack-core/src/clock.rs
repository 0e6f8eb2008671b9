use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Microsecond time source of the control loop.
///
/// Frame timestamps, timeouts and stage command scheduling all use the same
/// clock, so a simulation can replace it with [`ManualClock`].
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;

    /// Return no earlier than `deadline_us`.
    ///
    /// Stage commands are aligned between exposures with microsecond
    /// precision; OS sleeps are too coarse for that, so implementations
    /// busy-wait.
    fn wait_until_us(&self, deadline_us: u64);
}

/// Wall-clock time since construction, based on [`Instant`].
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn wait_until_us(&self, deadline_us: u64) {
        while self.now_us() < deadline_us {
            std::hint::spin_loop();
        }
    }
}

/// Clock that only advances when told to. Waiting jumps straight to the
/// deadline. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wait_until_us(&self, deadline_us: u64) {
        self.now.fetch_max(deadline_us, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_wait_never_goes_backwards() {
        let clock = ManualClock::new(500);
        clock.wait_until_us(100);
        assert_eq!(clock.now_us(), 500);
        clock.wait_until_us(900);
        assert_eq!(clock.now_us(), 900);
    }

    #[test]
    fn monotonic_wait_reaches_deadline() {
        let clock = MonotonicClock::new();
        let deadline = clock.now_us() + 200;
        clock.wait_until_us(deadline);
        assert!(clock.now_us() >= deadline);
    }
}
