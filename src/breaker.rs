//! Per-deployment circuit breaker.
//!
//! Lock-free: one atomic state byte plus a failure counter and the
//! open-transition timestamp, with compare-and-swap transitions so concurrent
//! requests agree on who gets the single half-open probe. Baseline-tagged
//! deployments construct an exempt breaker that always admits traffic.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Failures in a row before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker denies traffic before admitting a probe.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: AtomicU8,
    failures: AtomicU32,
    /// Unix millis of the most recent transition to open (or of the most
    /// recent half-open probe claim — see [`Self::allow`]).
    opened_at_ms: AtomicU64,
    threshold: u32,
    cooldown: Duration,
    exempt: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            threshold,
            cooldown,
            exempt: false,
        }
    }

    /// A breaker that always admits — for baseline deployments.
    pub fn exempt() -> Self {
        let mut b = Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN);
        b.exempt = true;
        b
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// May a call proceed right now?
    ///
    /// Closed admits everyone. Open admits nobody until the cooldown elapses,
    /// at which point exactly one caller wins the CAS into half-open and gets
    /// the probe. A half-open breaker whose probe never reported back (e.g.
    /// the candidate was selected as a fallback but never executed) re-admits
    /// one probe per cooldown period, claimed by CAS on the timestamp.
    pub fn allow(&self) -> bool {
        if self.exempt {
            return true;
        }
        loop {
            let state = self.state.load(Ordering::Acquire);
            match state {
                CLOSED => return true,
                OPEN => {
                    let opened = self.opened_at_ms.load(Ordering::Acquire);
                    if now_ms() < opened + self.cooldown.as_millis() as u64 {
                        return false;
                    }
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.opened_at_ms.store(now_ms(), Ordering::Release);
                        return true;
                    }
                    // Lost the race; re-read the state.
                }
                HALF_OPEN => {
                    let claimed = self.opened_at_ms.load(Ordering::Acquire);
                    if now_ms() < claimed + self.cooldown.as_millis() as u64 {
                        return false;
                    }
                    // Stale probe claim; take over the slot.
                    if self
                        .opened_at_ms
                        .compare_exchange(claimed, now_ms(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                _ => return true,
            }
        }
    }

    /// Record a successful call: closes the breaker and resets the counter.
    pub fn record_success(&self) {
        if self.exempt {
            return;
        }
        self.failures.store(0, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
    }

    /// Record a failed call.
    ///
    /// While closed, failures count toward the threshold; at the threshold the
    /// breaker opens. A half-open probe failure reopens immediately.
    pub fn record_failure(&self) {
        if self.exempt {
            return;
        }
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                self.opened_at_ms.store(now_ms(), Ordering::Release);
                self.state.store(OPEN, Ordering::Release);
            }
            CLOSED => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.threshold {
                    self.opened_at_ms.store(now_ms(), Ordering::Release);
                    self.state.store(OPEN, Ordering::Release);
                }
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}
