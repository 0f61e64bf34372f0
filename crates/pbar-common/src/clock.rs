//! Wall-clock seam.
//!
//! All `*_at` fields in the service are seconds since the Unix epoch as
//! `f64`. Production code reads the system clock; tests inject a
//! [`VirtualClock`] so timing-sensitive behavior (sampling intervals, TTLs,
//! idle expiry) is deterministic.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// How far a client-reported timestamp may diverge from the server clock
/// before it is ignored (seconds).
pub const CLIENT_SKEW_TOLERANCE_SECONDS: f64 = 300.0;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A settable clock for tests.
///
/// Clones share the same underlying time, so a clock handed to several
/// components can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Arc<Mutex<f64>>,
}

impl VirtualClock {
    /// Create a virtual clock starting at the given epoch time.
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// Pick the effective event time from the server clock and a client-reported
/// timestamp.
///
/// Clients send their own `now` with each event so that a burst of events
/// recorded client-side keeps its relative spacing even when delivery is
/// delayed. The client value is only trusted while it is within
/// [`CLIENT_SKEW_TOLERANCE_SECONDS`] of the server clock.
pub fn reconcile_client_now(server_now: f64, client_now: f64) -> f64 {
    if (server_now - client_now).abs() < CLIENT_SKEW_TOLERANCE_SECONDS {
        client_now
    } else {
        server_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_recent() {
        // Anything after 2020 is good enough to prove we're reading the
        // real clock and not returning a constant.
        assert!(SystemClock.now() > 1_577_836_800.0);
    }

    #[test]
    fn virtual_clock_advances() {
        let clock = VirtualClock::new(1000.0);
        assert_eq!(clock.now(), 1000.0);
        clock.advance(2.5);
        assert_eq!(clock.now(), 1002.5);
        clock.set(5000.0);
        assert_eq!(clock.now(), 5000.0);
    }

    #[test]
    fn virtual_clock_clones_share_time() {
        let a = VirtualClock::new(10.0);
        let b = a.clone();
        a.advance(5.0);
        assert_eq!(b.now(), 15.0);
    }

    #[test]
    fn client_now_within_tolerance_wins() {
        assert_eq!(reconcile_client_now(1000.0, 1010.0), 1010.0);
        assert_eq!(reconcile_client_now(1000.0, 990.0), 990.0);
    }

    #[test]
    fn client_now_outside_tolerance_is_ignored() {
        assert_eq!(reconcile_client_now(1000.0, 2000.0), 1000.0);
        assert_eq!(reconcile_client_now(1000.0, 100.0), 1000.0);
    }
}
