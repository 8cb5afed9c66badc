//! Token-bucket rate limiter keyed by caller identity.
//!
//! Each key owns a bucket holding up to `capacity` tokens. Buckets refill
//! lazily at `refill_per_sec` whenever they are consulted, so no timer or
//! background task is needed. An operation of a given cost is admitted only
//! if the bucket currently holds at least that many tokens.
//!
//! Construct one limiter per logical endpoint at startup and share it through
//! an `Arc`; recreating it per request would reset every bucket.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{Error, Result};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Accrue tokens for the time since the last refill and re-baseline the
    /// refill clock to `now`.
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The cost was debited; `remaining` tokens are left in the bucket.
    Admitted { remaining: f64 },
    /// Not enough tokens. `retry_after` is how long until the cost could be
    /// covered, or `None` when it never can (cost above capacity or invalid).
    Rejected { retry_after: Option<Duration> },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// In-process token-bucket rate limiter.
pub struct RateLimiter<K> {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<K, Bucket>>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    /// Create a new rate limiter.
    ///
    /// * `capacity`: maximum tokens a bucket can hold (the burst size).
    /// * `refill_per_sec`: tokens accrued per second, fractions allowed.
    ///
    /// Both must be finite and strictly positive.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Result<Self> {
        validate(capacity, refill_per_sec)?;
        Ok(Self {
            capacity,
            refill_per_sec,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Try to debit `cost` tokens from `key`'s bucket.
    ///
    /// Returns `true` if the operation is admitted. On `false` the bucket
    /// balance is left untouched apart from the refill.
    pub fn consume(&self, key: K, cost: f64) -> bool {
        self.check(key, cost).is_admitted()
    }

    /// Like [`consume`](Self::consume), but reports the remaining balance or
    /// the wait before the cost becomes affordable.
    pub fn check(&self, key: K, cost: f64) -> Decision {
        self.check_at(key, cost, Instant::now())
    }

    /// Debit `cost` or fail with [`Error::TooManyRequests`].
    ///
    /// A cost that can never be covered reports the time to refill an empty
    /// bucket.
    pub fn throttle(&self, key: K, cost: f64) -> Result<()> {
        match self.check(key, cost) {
            Decision::Admitted { .. } => Ok(()),
            Decision::Rejected { retry_after } => {
                let wait = retry_after.unwrap_or_else(|| self.full_refill());
                let secs = (wait.as_secs_f64().ceil() as u64).max(1);
                Err(Error::TooManyRequests { retry_after: secs })
            }
        }
    }

    pub(crate) fn check_at(&self, key: K, cost: f64, now: Instant) -> Decision {
        if !cost.is_finite() || cost < 0.0 {
            debug!(cost, "rejecting invalid rate limit cost");
            return Decision::Rejected { retry_after: None };
        }

        let mut buckets = self.buckets();
        let bucket = buckets.entry(key).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        bucket.refill(now, self.capacity, self.refill_per_sec);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Decision::Admitted {
                remaining: bucket.tokens,
            }
        } else if cost > self.capacity {
            Decision::Rejected { retry_after: None }
        } else {
            let deficit = cost - bucket.tokens;
            Decision::Rejected {
                retry_after: Duration::try_from_secs_f64(deficit / self.refill_per_sec).ok(),
            }
        }
    }

    /// Remove buckets untouched for at least `idle` that would be full if
    /// refilled now. Returns how many were removed.
    ///
    /// A removed key behaves exactly as before on its next use, since new
    /// buckets start full.
    pub fn sweep(&self, idle: Duration) -> usize {
        self.sweep_at(idle, Instant::now())
    }

    pub(crate) fn sweep_at(&self, idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let idle_for = now.saturating_duration_since(bucket.last_refill);
            let projected = bucket.tokens + idle_for.as_secs_f64() * self.refill_per_sec;
            idle_for < idle || projected < self.capacity
        });
        before - buckets.len()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.buckets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full_refill(&self) -> Duration {
        Duration::try_from_secs_f64(self.capacity / self.refill_per_sec).unwrap_or(Duration::MAX)
    }

    // Every statement leaves the map consistent, so a poisoned lock is safe to reuse.
    fn buckets(&self) -> MutexGuard<'_, HashMap<K, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Check limiter parameters: both must be finite and positive.
pub fn validate(capacity: f64, refill_per_sec: f64) -> Result<()> {
    if !capacity.is_finite() || capacity <= 0.0 {
        return Err(Error::Config(format!(
            "rate limit capacity must be a positive number, got {capacity}"
        )));
    }
    if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
        return Err(Error::Config(format!(
            "rate limit refill rate must be a positive number, got {refill_per_sec}"
        )));
    }
    Ok(())
}
