use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Decision, RateLimitStrategy};
use crate::clock::Clock;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Duration,
}

/// A token bucket holding up to `capacity` tokens, refilled continuously at
/// `limit / window` tokens per second. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second.
    rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(capacity: u32, limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = f64::from(capacity.max(1));
        let window_secs = window.as_secs_f64().max(f64::MIN_POSITIVE);
        let now = clock.now();
        Self {
            capacity,
            rate: f64::from(limit.max(1)) / window_secs,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: now }),
            clock,
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut st = self.state.lock();
        self.refill(&mut st);
        st.tokens
    }

    fn refill(&self, st: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.rate).min(self.capacity);
        st.last_refill = now.max(st.last_refill);
    }
}

impl RateLimitStrategy for TokenBucket {
    fn try_acquire(&self, permits: u32) -> Decision {
        let cost = f64::from(permits);
        let mut st = self.state.lock();
        self.refill(&mut st);

        if st.tokens >= cost {
            st.tokens -= cost;
            Decision::Allowed { remaining: st.tokens.floor() as u32 }
        } else {
            let missing = cost - st.tokens;
            Decision::Denied { retry_after: Duration::from_secs_f64(missing / self.rate) }
        }
    }
}

/// Counts admissions in the trailing `window` and denies once `limit` is reached.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    admitted: Mutex<VecDeque<Duration>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit.max(1),
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit as usize)),
            clock,
        }
    }

    /// Admissions still inside the window.
    pub fn in_window(&self) -> usize {
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, self.clock.now());
        admitted.len()
    }

    fn evict(&self, admitted: &mut VecDeque<Duration>, now: Duration) {
        while let Some(&oldest) = admitted.front() {
            if oldest + self.window <= now {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimitStrategy for SlidingWindow {
    fn try_acquire(&self, permits: u32) -> Decision {
        let now = self.clock.now();
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, now);

        let used = admitted.len();
        let permits = permits as usize;
        if used + permits <= self.limit as usize {
            admitted.extend(std::iter::repeat(now).take(permits));
            Decision::Allowed { remaining: (self.limit as usize - used - permits) as u32 }
        } else {
            // The slot that frees up first decides when a retry can succeed.
            let needed = used + permits - self.limit as usize;
            let retry_after = admitted
                .get(needed.saturating_sub(1))
                .map(|&t| (t + self.window).saturating_sub(now))
                .unwrap_or(self.window);
            Decision::Denied { retry_after }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn token_bucket_starts_full_and_drains() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(5, 10, Duration::from_secs(1), Arc::new(clock));
        for expected in (0..5).rev() {
            assert_eq!(bucket.try_acquire(1), Decision::Allowed { remaining: expected });
        }
        match bucket.try_acquire(1) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_millis(100)),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn token_bucket_refills_up_to_capacity() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(2, 4, Duration::from_secs(1), Arc::new(clock.clone()));
        assert!(bucket.try_acquire(2).is_allowed());
        clock.advance(Duration::from_millis(250));
        assert!(bucket.try_acquire(1).is_allowed());
        assert!(!bucket.try_acquire(1).is_allowed());

        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.available(), 2.0);
    }

    #[test]
    fn sliding_window_frees_slots_as_they_age_out() {
        let clock = ManualClock::new();
        let window = SlidingWindow::new(2, Duration::from_secs(10), Arc::new(clock.clone()));
        assert!(window.try_acquire(1).is_allowed());
        clock.advance(Duration::from_secs(4));
        assert!(window.try_acquire(1).is_allowed());

        match window.try_acquire(1) {
            Decision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(6)),
            other => panic!("expected denial, got {other:?}"),
        }

        clock.advance(Duration::from_secs(6));
        assert_eq!(window.in_window(), 1);
        assert!(window.try_acquire(1).is_allowed());
    }

    #[test]
    fn sliding_window_never_exceeds_limit_in_any_window() {
        let clock = ManualClock::new();
        let limit = 7;
        let w = Duration::from_millis(1000);
        let window = SlidingWindow::new(limit, w, Arc::new(clock.clone()));
        let mut admitted: Vec<Duration> = Vec::new();
        for _ in 0..500 {
            if window.try_acquire(1).is_allowed() {
                admitted.push(clock.now());
            }
            clock.advance(Duration::from_millis(37));
        }
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..].iter().take_while(|t| **t < *start + w).count();
            assert!(in_window <= limit as usize);
        }
    }
}
