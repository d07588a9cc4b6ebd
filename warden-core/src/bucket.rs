// Warden - tenant-aware admission control
// File: warden-core/src/bucket.rs

use std::time::Instant;

use parking_lot::Mutex;

/// Continuous-refill token bucket.
///
/// The bucket is constructed with a refill rate (tokens per second) and a
/// capacity. Refill is lazy: every operation first credits
/// `elapsed × rate` tokens, clamped to capacity, before doing its work.
/// A bucket with `rate == 0` and `capacity == 0` is unlimited: `take`
/// always succeeds and `available` reports infinity.
///
/// All operations serialize on one internal mutex and are O(1).
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn unlimited(&self) -> bool {
        self.rate <= 0.0 && self.capacity <= 0.0
    }

    fn refill(&mut self, now: Instant) {
        // A regressed clock must neither mint tokens nor rewind the
        // refill horizon.
        if now <= self.last_refill {
            return;
        }
        let dt = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + dt * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::new_at(rate, capacity, Instant::now())
    }

    pub fn new_at(rate: f64, capacity: f64, now: Instant) -> Self {
        let rate = rate.max(0.0);
        let capacity = capacity.max(0.0);
        Self {
            state: Mutex::new(BucketState {
                rate,
                capacity,
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Debits `n` tokens if the full amount is available. Returns whether
    /// the debit happened; on refusal the balance is left unchanged.
    pub fn take(&self, n: f64) -> bool {
        self.take_at(n, Instant::now())
    }

    pub fn take_at(&self, n: f64, now: Instant) -> bool {
        let mut st = self.state.lock();
        if st.unlimited() {
            return true;
        }
        st.refill(now);
        if st.tokens >= n {
            st.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Debits as much of `n` as is available and returns the amount taken.
    /// Used for best-effort accounting where refusal is not an option.
    pub fn take_max(&self, n: f64) -> f64 {
        self.take_max_at(n, Instant::now())
    }

    pub fn take_max_at(&self, n: f64, now: Instant) -> f64 {
        let mut st = self.state.lock();
        if st.unlimited() {
            return n;
        }
        st.refill(now);
        let taken = st.tokens.min(n.max(0.0));
        st.tokens -= taken;
        taken
    }

    /// Current balance after refill. Unlimited buckets report infinity.
    pub fn available(&self) -> f64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&self, now: Instant) -> f64 {
        let mut st = self.state.lock();
        if st.unlimited() {
            return f64::INFINITY;
        }
        st.refill(now);
        st.tokens
    }

    pub fn set_rate(&self, rate: f64) {
        self.set_rate_at(rate, Instant::now());
    }

    pub fn set_rate_at(&self, rate: f64, now: Instant) {
        let mut st = self.state.lock();
        st.refill(now);
        st.rate = rate.max(0.0);
    }

    pub fn set_capacity(&self, capacity: f64) {
        self.set_capacity_at(capacity, Instant::now());
    }

    pub fn set_capacity_at(&self, capacity: f64, now: Instant) {
        let mut st = self.state.lock();
        st.refill(now);
        st.capacity = capacity.max(0.0);
        if st.tokens > st.capacity {
            st.tokens = st.capacity;
        }
    }

    /// Applies a new `(rate, capacity)` pair in place. Accumulated credit
    /// is refilled under the old parameters first so it is not lost; the
    /// balance is clamped down when the new capacity is smaller. Leaving
    /// the unlimited state grants a full bucket.
    pub fn retune(&self, rate: f64, capacity: f64) {
        self.retune_at(rate, capacity, Instant::now());
    }

    pub fn retune_at(&self, rate: f64, capacity: f64, now: Instant) {
        let mut st = self.state.lock();
        let was_unlimited = st.unlimited();
        st.refill(now);
        st.rate = rate.max(0.0);
        st.capacity = capacity.max(0.0);
        if was_unlimited || st.tokens > st.capacity {
            st.tokens = if was_unlimited {
                st.capacity
            } else {
                st.capacity.min(st.tokens)
            };
        }
    }

    /// Restores a full balance.
    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&self, now: Instant) {
        let mut st = self.state.lock();
        st.tokens = st.capacity;
        st.last_refill = now;
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn capacity(&self) -> f64 {
        self.state.lock().capacity
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("rate", &st.rate)
            .field("capacity", &st.capacity)
            .field("tokens", &st.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn take_debits_and_refuses() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(5.0, 10.0, now);

        assert!(bucket.take_at(5.0, now));
        assert!(bucket.take_at(5.0, now));
        assert!(!bucket.take_at(1.0, now));
        // Refusal leaves the balance untouched.
        assert_eq!(bucket.available_at(now), 0.0);
    }

    #[test]
    fn refill_is_lazy_and_clamped() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 10.0, now);
        assert!(bucket.take_at(10.0, now));

        let later = now + Duration::from_millis(500);
        let tokens = bucket.available_at(later);
        assert!((tokens - 5.0).abs() < 1e-6, "got {tokens}");

        // Far future clamps to capacity.
        let far = now + Duration::from_secs(3600);
        assert_eq!(bucket.available_at(far), 10.0);
    }

    #[test]
    fn burst_exhausted_then_refilled_after_one_over_rate() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(100.0, 100.0, now);
        assert!(bucket.take_at(100.0, now));
        assert!(!bucket.take_at(1.0, now));

        // 1/rate seconds later one token is back.
        let later = now + Duration::from_millis(10);
        assert!(bucket.take_at(1.0, later));
    }

    #[test]
    fn zero_rate_zero_capacity_is_unlimited() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(0.0, 0.0, now);
        for _ in 0..1_000_000 {
            assert!(bucket.take_at(1.0, now));
        }
        assert_eq!(bucket.available_at(now), f64::INFINITY);
    }

    #[test]
    fn take_max_is_best_effort() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1.0, 10.0, now);
        assert_eq!(bucket.take_max_at(4.0, now), 4.0);
        assert_eq!(bucket.take_max_at(100.0, now), 6.0);
        assert_eq!(bucket.take_max_at(1.0, now), 0.0);
    }

    #[test]
    fn retune_preserves_tokens_and_clamps() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(1000.0, 1200.0, now);
        assert!(bucket.take_at(1150.0, now));
        assert_eq!(bucket.available_at(now), 50.0);

        bucket.retune_at(2000.0, 2000.0, now);
        assert_eq!(bucket.available_at(now), 50.0);

        // 1/rate seconds later roughly one more token per msec of rate.
        let later = now + Duration::from_millis(1);
        let tokens = bucket.available_at(later);
        assert!((tokens - 52.0).abs() < 1e-6, "got {tokens}");
    }

    #[test]
    fn retune_down_clamps_balance() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(100.0, 100.0, now);
        bucket.retune_at(10.0, 10.0, now);
        assert_eq!(bucket.available_at(now), 10.0);
    }

    #[test]
    fn retune_out_of_unlimited_grants_full_bucket() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(0.0, 0.0, now);
        bucket.retune_at(50.0, 60.0, now);
        assert_eq!(bucket.available_at(now), 60.0);
    }

    #[test]
    fn set_capacity_clamps_down() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 100.0, now);
        bucket.set_capacity_at(30.0, now);
        assert_eq!(bucket.available_at(now), 30.0);
    }

    #[test]
    fn reset_restores_full_balance() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 100.0, now);
        assert!(bucket.take_at(70.0, now));
        bucket.reset_at(now);
        assert_eq!(bucket.available_at(now), 100.0);
    }

    #[test]
    fn wall_clock_regressions_do_not_inflate_balance() {
        let now = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 100.0, now);
        assert!(bucket.take_at(50.0, now + Duration::from_secs(1)));
        // An earlier timestamp must not mint tokens or rewind the
        // refill horizon.
        assert_eq!(bucket.available_at(now), 50.0);
        assert_eq!(bucket.available_at(now + Duration::from_secs(1)), 50.0);
    }
}
