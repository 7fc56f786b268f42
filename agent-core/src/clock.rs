//! Monotonic-enough wall time for the core.
//!
//! All time-sensitive logic (session expiry, scheduler eligibility, backoff)
//! goes through a [`Clock`] handle instead of calling `SystemTime::now()`
//! directly, so tests can drive the scheduler and session registry with a
//! fake clock instead of sleeping in real time.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Millisecond-precision timestamp, serialized as an integer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TimestampMs(i64);

impl TimestampMs {
    pub const fn from_i64(ms: i64) -> Self {
        Self(ms)
    }

    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Seconds elapsed from `self` to `other`, saturating at zero if `other`
    /// is not after `self`.
    pub fn secs_until(&self, other: TimestampMs) -> u64 {
        let delta_ms = other.0.saturating_sub(self.0);
        if delta_ms <= 0 {
            0
        } else {
            (delta_ms as u64) / 1000
        }
    }

    pub fn plus_secs(&self, secs: u64) -> TimestampMs {
        Self(self.0.saturating_add((secs as i64).saturating_mul(1000)))
    }
}

impl fmt::Display for TimestampMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Abstracts over "now" so time-sensitive components can be tested
/// deterministically.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> TimestampMs;
}

/// Production clock backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch");
        TimestampMs(now.as_millis() as i64)
    }
}

/// A clock that can be advanced manually, for deterministic tests of backoff,
/// expiry, and scheduler eligibility.
#[derive(Debug)]
pub struct FakeClock {
    now_ms: AtomicI64,
}

impl FakeClock {
    pub fn new(start: TimestampMs) -> Self {
        Self {
            now_ms: AtomicI64::new(start.as_i64()),
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.now_ms
            .fetch_add((secs as i64).saturating_mul(1000), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(self.now_ms.load(Ordering::SeqCst))
    }
}
