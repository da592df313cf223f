//! Boot-time monotonic clock.
//!
//! Every session timestamp in the decision table is nanoseconds on
//! `CLOCK_BOOTTIME`, matching the clock the XDP program reads with
//! `bpf_ktime_get_boot_ns`. The boot clock keeps counting across
//! suspend/resume, so a laptop that sleeps through its session lifetime
//! wakes up unauthenticated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds since boot.
    fn now_ns(&self) -> u64;
}

/// The real `CLOCK_BOOTTIME`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BootClock;

impl Clock for BootClock {
    fn now_ns(&self) -> u64 {
        // CLOCK_BOOTTIME cannot fail on any kernel new enough to run the
        // XDP program; a zero here would only make sessions stricter.
        clock_gettime(ClockId::CLOCK_BOOTTIME)
            .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    #[must_use]
    pub fn new(start_ns: u64) -> Self {
        Self(AtomicU64::new(start_ns))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, ns: u64) {
        self.0.store(ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_clock_is_monotonic() {
        let clock = BootClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(5);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now_ns(), 1_000_000_005);
        clock.set(42);
        assert_eq!(clock.now_ns(), 42);
    }
}
