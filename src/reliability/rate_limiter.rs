//! Outbound throughput governor, one per entity type.
//!
//! A token bucket refilled at the effective rate, holding at most
//! `rate * burst_seconds` tokens. The effective rate is the configured limit,
//! or with traffic shaping enabled, the rate observed over a trailing window
//! times a headroom factor (never above a configured limit).

use crate::properties::EntityProperties;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lower bound for a shaped rate so an idle window cannot stall a pipeline.
const MIN_SHAPED_RATE: f64 = 1.0;

/// Per-second counters over a trailing window.
#[derive(Debug)]
struct SlidingWindow {
    origin: Instant,
    buckets: VecDeque<(u64, u64)>,
    total: u64,
}

impl SlidingWindow {
    fn new(origin: Instant) -> Self {
        Self {
            origin,
            buckets: VecDeque::new(),
            total: 0,
        }
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        let Some(horizon) = self.second(now).checked_sub(window.as_secs().max(1)) else {
            return;
        };
        while let Some(&(second, count)) = self.buckets.front() {
            if second > horizon {
                break;
            }
            self.total -= count;
            self.buckets.pop_front();
        }
    }

    fn record(&mut self, n: u64, now: Instant, window: Duration) {
        let second = self.second(now);
        match self.buckets.back_mut() {
            Some((last, count)) if *last == second => *count += n,
            _ => self.buckets.push_back((second, n)),
        }
        self.total += n;
        self.evict(now, window);
    }

    /// Average items per second over the window, or over the time elapsed
    /// since the first sample when that is shorter.
    fn rate(&mut self, now: Instant, window: Duration) -> f64 {
        self.evict(now, window);
        let Some(&(first, _)) = self.buckets.front() else {
            return 0.0;
        };
        let span = (self.second(now) - first + 1).min(window.as_secs().max(1));
        self.total as f64 / span as f64
    }
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
    window: SlidingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterSnapshot {
    pub effective_rate: f64,
    pub capacity: f64,
    pub available: f64,
    pub observed_rate: f64,
}

#[derive(Debug)]
pub struct RateLimiter {
    props: Arc<EntityProperties>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(props: Arc<EntityProperties>) -> Self {
        let now = Instant::now();
        Self {
            props,
            state: Mutex::new(LimiterState {
                tokens: 0.0,
                last_refill: now,
                rate: 0.0,
                capacity: 0.0,
                window: SlidingWindow::new(now),
            }),
        }
    }

    pub fn properties(&self) -> &Arc<EntityProperties> {
        &self.props
    }

    /// Records items arriving at the pipeline; feeds traffic shaping.
    pub fn record_received(&self, n: usize) {
        self.record_received_at(n, Instant::now());
    }

    pub fn record_received_at(&self, n: usize, now: Instant) {
        let window = self.props.traffic_shaping_window();
        self.state.lock().window.record(n as u64, now, window);
    }

    pub fn try_acquire(&self, n: usize) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    /// Takes `n` permits if available. A request larger than the whole bucket
    /// is granted only from a full bucket and leaves it in debt.
    pub fn try_acquire_at(&self, n: usize, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.rate <= 0.0 {
            return true;
        }

        let wanted = n as f64;
        if wanted <= state.tokens || (wanted > state.capacity && state.tokens >= state.capacity) {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Time until `n` permits could be granted, zero when unlimited.
    pub fn time_until_available(&self, n: usize, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        if state.rate <= 0.0 {
            return Duration::ZERO;
        }

        let needed = (n as f64).min(state.capacity);
        let deficit = needed - state.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / state.rate)
        }
    }

    /// Waits until `n` permits are granted. Returns false when cancelled.
    pub async fn acquire(&self, n: usize, cancel: &CancellationToken) -> bool {
        loop {
            let now = Instant::now();
            if self.try_acquire_at(n, now) {
                return true;
            }
            let wait = self
                .time_until_available(n, now)
                .max(Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Largest batch a single acquire can take without going into debt;
    /// `None` when unlimited.
    pub fn max_permits(&self) -> Option<usize> {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());
        if state.rate <= 0.0 {
            None
        } else {
            Some((state.capacity.floor() as usize).max(1))
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refresh(&mut state, now);
        let window = self.props.traffic_shaping_window();
        RateLimiterSnapshot {
            effective_rate: state.rate,
            capacity: state.capacity,
            available: state.tokens,
            observed_rate: state.window.rate(now, window),
        }
    }

    fn effective_rate(&self, state: &mut LimiterState, now: Instant) -> f64 {
        let configured = self.props.rate_limit();
        if !self.props.traffic_shaping() {
            return configured;
        }

        let observed = state.window.rate(now, self.props.traffic_shaping_window());
        if observed <= 0.0 {
            return configured;
        }
        let shaped = (observed * self.props.traffic_shaping_headroom()).max(MIN_SHAPED_RATE);
        if configured > 0.0 {
            shaped.min(configured)
        } else {
            shaped
        }
    }

    fn refresh(&self, state: &mut LimiterState, now: Instant) {
        let rate = self.effective_rate(state, now);
        let capacity = rate * self.props.burst_seconds() as f64;

        if rate <= 0.0 {
            state.rate = 0.0;
            state.capacity = 0.0;
            state.tokens = 0.0;
            state.last_refill = now;
            return;
        }

        if state.rate <= 0.0 {
            // Newly limited: start with a full bucket.
            state.tokens = capacity;
        } else {
            let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * state.rate).min(capacity);
        }

        state.rate = rate;
        state.capacity = capacity;
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntityType;

    fn limiter(rate: f64, burst: u64) -> RateLimiter {
        let props = EntityProperties::new(EntityType::Points);
        props.set_rate_limit(rate);
        props.set_burst_seconds(burst);
        RateLimiter::new(Arc::new(props))
    }

    #[test]
    fn test_unlimited_always_acquires() {
        let limiter = limiter(0.0, 10);
        for _ in 0..1000 {
            assert!(limiter.try_acquire(1_000_000));
        }
        assert_eq!(limiter.max_permits(), None);
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = limiter(10.0, 2);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(20, now));
        assert!(!limiter.try_acquire_at(1, now));
        assert_eq!(limiter.max_permits(), Some(20));
    }

    #[test]
    fn test_refill_after_time() {
        let limiter = limiter(10.0, 1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(10, start));
        assert!(!limiter.try_acquire_at(5, start));
        assert!(limiter.try_acquire_at(5, start + Duration::from_millis(500)));
        assert!(
            limiter.time_until_available(10, start + Duration::from_millis(500))
                >= Duration::from_millis(999)
        );
    }

    #[test]
    fn test_oversized_request_only_from_full_bucket() {
        let limiter = limiter(10.0, 1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(25, start));
        assert!(!limiter.try_acquire_at(1, start + Duration::from_secs(1)));
        assert!(limiter.try_acquire_at(1, start + Duration::from_millis(2600)));
    }

    #[test]
    fn test_sustained_throughput_never_exceeds_rate_plus_burst() {
        let rate = 50.0;
        let burst = 3;
        let limiter = limiter(rate, burst);
        let start = Instant::now();

        let mut granted = 0u64;
        for tick in 0..20_000u64 {
            let now = start + Duration::from_millis(tick);
            if limiter.try_acquire_at(7, now) {
                granted += 7;
            }
            let elapsed = tick as f64 / 1000.0;
            assert!(granted as f64 <= rate * burst as f64 + rate * elapsed + 1e-6);
        }
        assert!(granted as f64 >= rate * 19.0);
    }

    #[test]
    fn test_rate_change_applies_without_restart() {
        let limiter = limiter(0.0, 1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(1000, start));

        limiter.properties().set_rate_limit(5.0);
        assert!(limiter.try_acquire_at(5, start));
        assert!(!limiter.try_acquire_at(1, start));
    }

    #[test]
    fn test_traffic_shaping_follows_observed_rate() {
        let limiter = limiter(0.0, 1);
        limiter.properties().set_traffic_shaping(true);
        limiter.properties().set_traffic_shaping_headroom(1.5);
        let start = Instant::now();

        for second in 0..10 {
            limiter.record_received_at(100, start + Duration::from_secs(second));
        }
        let now = start + Duration::from_secs(9);
        assert!(limiter.try_acquire_at(150, now));
        assert!(!limiter.try_acquire_at(1, now));
    }

    #[test]
    fn test_traffic_shaping_never_exceeds_static_limit() {
        let limiter = limiter(20.0, 1);
        limiter.properties().set_traffic_shaping(true);
        let start = Instant::now();
        for second in 0..5 {
            limiter.record_received_at(1000, start + Duration::from_secs(second));
        }
        let now = start + Duration::from_secs(4);
        assert!(limiter.try_acquire_at(20, now));
        assert!(!limiter.try_acquire_at(1, now));
    }

    #[test]
    fn test_sliding_window_evicts_old_samples() {
        let start = Instant::now();
        let window = Duration::from_secs(10);
        let mut sliding = SlidingWindow::new(start);
        sliding.record(100, start, window);
        assert_eq!(sliding.rate(start, window), 100.0);

        let later = start + Duration::from_secs(30);
        assert_eq!(sliding.rate(later, window), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = limiter(10.0, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(10, &cancel).await);

        let before = Instant::now();
        assert!(limiter.acquire(10, &cancel).await);
        assert!(Instant::now() - before >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_cancellable() {
        let limiter = limiter(1.0, 1);
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(1, &cancel).await);

        cancel.cancel();
        assert!(!limiter.acquire(1, &cancel).await);
    }
}
