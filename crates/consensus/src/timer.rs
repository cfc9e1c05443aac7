//! Wall-clock source and the single-shot round deadline timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonic source of wall-clock milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock driven by hand, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at the given millisecond timestamp.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Advances the clock.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// The single-shot deadline timer owned by a consensus round.
///
/// One deadline exists at a time; it is re-armed on every round
/// initialization. `extend_by_factor` only ever moves the deadline forward,
/// `reset` sets it unconditionally.
#[derive(Debug, Clone)]
pub struct RoundTimer {
    deadline_ms: u64,
    base_delay_ms: u64,
    height: u32,
    view_number: u8,
}

impl RoundTimer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self {
            deadline_ms: u64::MAX,
            base_delay_ms: 0,
            height: 0,
            view_number: 0,
        }
    }

    /// Arms the timer for `(height, view)` with deadline `now + delay`.
    ///
    /// `base_delay_ms` is the unit used by [`extend_by_factor`]; callers pass
    /// the block interval divided by the validator count, so an extension
    /// factor is expressed in per-validator shares of a block time.
    ///
    /// [`extend_by_factor`]: RoundTimer::extend_by_factor
    pub fn arm(
        &mut self,
        clock: &dyn Clock,
        delay_ms: u64,
        base_delay_ms: u64,
        height: u32,
        view_number: u8,
    ) {
        self.deadline_ms = clock.now_ms().saturating_add(delay_ms);
        self.base_delay_ms = base_delay_ms;
        self.height = height;
        self.view_number = view_number;
    }

    /// Unconditionally moves the deadline to `now + delay`.
    pub fn reset(&mut self, clock: &dyn Clock, delay_ms: u64) {
        self.deadline_ms = clock.now_ms().saturating_add(delay_ms);
    }

    /// Moves the deadline to `now + factor × base_delay`, but only forward:
    /// a deadline already later than the candidate is left untouched.
    pub fn extend_by_factor(&mut self, clock: &dyn Clock, factor: u64) {
        let candidate = clock
            .now_ms()
            .saturating_add(factor.saturating_mul(self.base_delay_ms));
        if candidate > self.deadline_ms {
            self.deadline_ms = candidate;
        }
    }

    /// The current deadline in epoch milliseconds.
    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Whether the deadline has passed.
    pub fn is_due(&self, clock: &dyn Clock) -> bool {
        clock.now_ms() >= self.deadline_ms
    }

    /// Whether this timer belongs to the given round.
    pub fn matches(&self, height: u32, view_number: u8) -> bool {
        self.height == height && self.view_number == view_number
    }

    /// The round this timer was armed for.
    pub fn round(&self) -> (u32, u8) {
        (self.height, self.view_number)
    }
}

impl Default for RoundTimer {
    fn default() -> Self {
        Self::new()
    }
}
