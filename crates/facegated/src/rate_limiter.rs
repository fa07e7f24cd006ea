use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Rejections allowed inside one window before the account locks.
const MAX_REJECTIONS: u32 = 5;
/// Window over which rejections are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// How long a locked account stays locked.
const LOCKOUT: Duration = Duration::from_secs(300);

struct AttemptRecord {
    rejections: u32,
    /// Verifications admitted but not yet settled.
    in_flight: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl AttemptRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            rejections: 0,
            in_flight: 0,
            window_start: now,
            locked_until: None,
        }
    }

    /// Start a new window, keeping attempts that are still running.
    fn reset(&mut self, now: Instant) {
        *self = Self {
            in_flight: self.in_flight,
            ..Self::fresh(now)
        };
    }

    fn is_idle(&self) -> bool {
        self.rejections == 0 && self.in_flight == 0 && self.locked_until.is_none()
    }
}

/// Per-email limiter for verification attempts.
///
/// Only biometric rejections count. Missing faces, fetch failures and other
/// system errors never lock an account out. An attempt reserves a slot in
/// [`RateLimiter::begin`] and holds it until it is settled, so concurrent
/// requests for one email can never exceed the rejection budget.
pub struct RateLimiter {
    records: HashMap<String, AttemptRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Reserve a verification attempt.
    ///
    /// `Err(seconds_remaining)` while the email is locked, or while running
    /// attempts could already use up the remaining budget.
    pub fn begin(&mut self, email: &str) -> Result<(), u64> {
        let now = Instant::now();
        let record = self
            .records
            .entry(email.to_string())
            .or_insert_with(|| AttemptRecord::fresh(now));

        match record.locked_until {
            Some(until) if now < until => {
                // rounded up
                let remaining = until.duration_since(now);
                return Err(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0));
            }
            Some(_) => record.reset(now),
            None if now.duration_since(record.window_start) >= WINDOW => record.reset(now),
            None => {}
        }

        if record.rejections + record.in_flight >= MAX_REJECTIONS {
            tracing::debug!(in_flight = record.in_flight, "verification budget reserved");
            return Err(1);
        }
        record.in_flight += 1;
        Ok(())
    }

    /// Settle an attempt as a biometric rejection. May lock the email.
    pub fn record_rejection(&mut self, email: &str) {
        let now = Instant::now();
        let record = self
            .records
            .entry(email.to_string())
            .or_insert_with(|| AttemptRecord::fresh(now));
        record.in_flight = record.in_flight.saturating_sub(1);

        if record.locked_until.is_none() && now.duration_since(record.window_start) >= WINDOW {
            record.reset(now);
        }

        record.rejections += 1;
        if record.rejections >= MAX_REJECTIONS {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                rejections = record.rejections,
                lockout_secs = LOCKOUT.as_secs(),
                "verification lockout triggered"
            );
        } else {
            tracing::debug!(
                rejections = record.rejections,
                max = MAX_REJECTIONS,
                "verification rejected"
            );
        }
    }

    /// Settle an attempt as accepted. Clears the rejection count.
    pub fn record_success(&mut self, email: &str) {
        if let Some(record) = self.records.get_mut(email) {
            let in_flight = record.in_flight.saturating_sub(1);
            *record = AttemptRecord {
                in_flight,
                ..AttemptRecord::fresh(Instant::now())
            };
        }
        self.forget_if_idle(email);
    }

    /// Give back an attempt that ended without a biometric decision.
    pub fn release(&mut self, email: &str) {
        if let Some(record) = self.records.get_mut(email) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
        self.forget_if_idle(email);
    }

    fn forget_if_idle(&mut self, email: &str) {
        if self.records.get(email).is_some_and(AttemptRecord::is_idle) {
            self.records.remove(email);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved verification attempt.
///
/// Dropping it unsettled, for example when the handler bails out with a
/// no-face or system error, releases the reservation without counting it.
pub struct Attempt {
    limiter: Arc<Mutex<RateLimiter>>,
    email: String,
    settled: bool,
}

impl Attempt {
    pub fn begin(limiter: &Arc<Mutex<RateLimiter>>, email: &str) -> Result<Self, u64> {
        lock(limiter).begin(email)?;
        Ok(Self {
            limiter: Arc::clone(limiter),
            email: email.to_string(),
            settled: false,
        })
    }

    pub fn accepted(mut self) {
        self.settled = true;
        lock(&self.limiter).record_success(&self.email);
    }

    pub fn rejected(mut self) {
        self.settled = true;
        lock(&self.limiter).record_rejection(&self.email);
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.limiter).release(&self.email);
        }
    }
}

/// The limiter's state stays consistent across a panic, so poisoning is ignored.
fn lock(limiter: &Mutex<RateLimiter>) -> MutexGuard<'_, RateLimiter> {
    limiter.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "alice@example.com";

    fn reject(rl: &mut RateLimiter, email: &str) {
        rl.begin(email).unwrap();
        rl.record_rejection(email);
    }

    #[test]
    fn test_allows_under_limit() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_REJECTIONS - 1 {
            reject(&mut rl, ALICE);
        }
        assert!(rl.begin(ALICE).is_ok());
    }

    #[test]
    fn test_locks_after_max_rejections() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_REJECTIONS {
            reject(&mut rl, ALICE);
        }
        let remaining = rl.begin(ALICE).unwrap_err();
        assert!(remaining > 0 && remaining <= LOCKOUT.as_secs());
    }

    #[test]
    fn test_success_clears_record() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_REJECTIONS - 1 {
            reject(&mut rl, ALICE);
        }
        rl.begin(ALICE).unwrap();
        rl.record_success(ALICE);
        assert!(rl.records.is_empty());
        reject(&mut rl, ALICE);
        assert!(rl.begin(ALICE).is_ok());
    }

    #[test]
    fn test_independent_per_email() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_REJECTIONS {
            reject(&mut rl, ALICE);
        }
        assert!(rl.begin("bob@example.com").is_ok());
        assert!(rl.begin(ALICE).is_err());
    }

    #[test]
    fn test_released_attempt_leaves_no_record() {
        let mut rl = RateLimiter::new();
        rl.begin(ALICE).unwrap();
        rl.release(ALICE);
        assert!(rl.records.is_empty());
    }

    #[test]
    fn test_running_attempts_hold_the_budget() {
        let mut rl = RateLimiter::new();
        for _ in 0..MAX_REJECTIONS {
            rl.begin(ALICE).unwrap();
        }
        assert_eq!(rl.begin(ALICE), Err(1));

        rl.release(ALICE);
        assert!(rl.begin(ALICE).is_ok());
    }

    #[test]
    fn test_budget_counts_rejections_and_running_attempts() {
        let mut rl = RateLimiter::new();
        for _ in 0..3 {
            reject(&mut rl, ALICE);
        }
        rl.begin(ALICE).unwrap();
        rl.begin(ALICE).unwrap();
        assert!(rl.begin(ALICE).is_err());
    }

    #[test]
    fn test_dropped_attempt_is_released() {
        let shared = Arc::new(Mutex::new(RateLimiter::new()));
        {
            let _attempt = Attempt::begin(&shared, ALICE).unwrap();
            assert_eq!(lock(&shared).records[ALICE].in_flight, 1);
        }
        assert!(lock(&shared).records.is_empty());
    }

    #[test]
    fn test_rejected_attempt_counts_once() {
        let shared = Arc::new(Mutex::new(RateLimiter::new()));
        Attempt::begin(&shared, ALICE).unwrap().rejected();
        let limiter = lock(&shared);
        let record = &limiter.records[ALICE];
        assert_eq!(record.rejections, 1);
        assert_eq!(record.in_flight, 0);
    }
}
