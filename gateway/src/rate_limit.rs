use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Quota attached to an allow rule: at most `max` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub max: u32,
    pub window: Duration,
}

/// Identity a limiter is keyed by. Each (endpoint, rule, agent) triple gets
/// its own independent window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub endpoint: String,
    pub rule_index: usize,
    pub agent_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    Admitted,
    Exceeded { retry_after: Duration },
}

impl RateOutcome {
    /// Seconds to advertise in `Retry-After`, rounded up, never below 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RateOutcome::Admitted => None,
            RateOutcome::Exceeded { retry_after } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
        }
    }
}

/// Sliding window of admission timestamps for one key.
#[derive(Debug, Default)]
struct SlidingWindow {
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn allow(&self, quota: &RateQuota, now: Instant) -> RateOutcome {
        let mut timestamps = self.timestamps.lock();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= quota.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < quota.max as usize {
            timestamps.push_back(now);
            return RateOutcome::Admitted;
        }

        let retry_after = timestamps
            .front()
            .map(|oldest| quota.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(quota.window);
        RateOutcome::Exceeded { retry_after }
    }

    fn newest(&self) -> Option<Instant> {
        self.timestamps.lock().back().copied()
    }
}

/// Registry of sliding-window limiters, created lazily per key.
///
/// The map sits behind a read-mostly lock; each limiter carries its own
/// mutex so contended keys do not serialize unrelated traffic.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<RateKey, Arc<SlidingWindow>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &RateKey, quota: &RateQuota) -> RateOutcome {
        self.check_at(key, quota, Instant::now())
    }

    fn check_at(&self, key: &RateKey, quota: &RateQuota, now: Instant) -> RateOutcome {
        if let Some(limiter) = self.limiters.read().get(key) {
            return limiter.allow(quota, now);
        }

        let limiter = {
            let mut limiters = self.limiters.write();
            limiters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SlidingWindow::default()))
                .clone()
        };
        limiter.allow(quota, now)
    }

    /// Drop limiters whose newest admission left the given window long ago.
    /// Called from the gateway housekeeping task.
    pub fn prune_idle(&self, older_than: Duration) {
        let now = Instant::now();
        self.limiters.write().retain(|_, limiter| {
            limiter
                .newest()
                .is_some_and(|newest| now.duration_since(newest) < older_than)
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.limiters.read().len()
    }
}
