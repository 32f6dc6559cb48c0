//! Per-address request limiting for the HTTP surface.
//!
//! Every request, upgrade or status, spends one token from the bucket of its
//! source address. A bucket holds `http_requests_per_window` tokens and
//! refills evenly over `http_window_secs`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::SecurityConfig;
use crate::hub::RelayHub;
use crate::observability::metrics;

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        self.refill(capacity, refill_rate, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token buckets keyed by source address.
#[derive(Default)]
pub struct HttpRateLimiter {
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl HttpRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend one token for `ip`. Returns false once the bucket is empty.
    pub fn check(&self, ip: IpAddr, config: &SecurityConfig) -> bool {
        self.check_at(ip, config, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, config: &SecurityConfig, now: Instant) -> bool {
        let (capacity, rate) = limits(config);
        let mut buckets = self.buckets.lock().expect("http limiter mutex poisoned");
        buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(capacity, now))
            .try_acquire(capacity, rate, now)
    }

    /// Forget addresses whose bucket has refilled completely.
    pub fn prune_full(&self, config: &SecurityConfig) -> usize {
        self.prune_full_at(config, Instant::now())
    }

    pub fn prune_full_at(&self, config: &SecurityConfig, now: Instant) -> usize {
        let (capacity, rate) = limits(config);
        let mut buckets = self.buckets.lock().expect("http limiter mutex poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(capacity, rate, now);
            bucket.tokens < capacity
        });
        before - buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().expect("http limiter mutex poisoned").len()
    }

    pub fn clear(&self) {
        self.buckets.lock().expect("http limiter mutex poisoned").clear();
    }
}

fn limits(config: &SecurityConfig) -> (f64, f64) {
    let capacity = config.http_requests_per_window.max(1) as f64;
    let rate = capacity / config.http_window_secs.max(1) as f64;
    (capacity, rate)
}

/// Middleware applying [`HttpRateLimiter`] to every route.
pub async fn http_rate_limit(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<RelayHub>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip().to_canonical();
    let config = hub.admission.config();

    if hub.http_limiter.check(ip, &config) {
        next.run(request).await
    } else {
        tracing::warn!(ip = %ip, path = %request.uri().path(), "HTTP rate limit exceeded");
        metrics::record_admission_rejected("http_rate");
        (StatusCode::TOO_MANY_REQUESTS, "Too many requests, please try again later.").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(requests: u32, window_secs: u64) -> SecurityConfig {
        SecurityConfig {
            http_requests_per_window: requests,
            http_window_secs: window_secs,
            ..SecurityConfig::default()
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn hundred_and_first_request_is_refused() {
        let limiter = HttpRateLimiter::new();
        let config = SecurityConfig::default();
        let ip = addr("198.51.100.7");
        let now = Instant::now();

        for _ in 0..100 {
            assert!(limiter.check_at(ip, &config, now));
        }
        assert!(!limiter.check_at(ip, &config, now));
        assert!(limiter.check_at(addr("198.51.100.8"), &config, now));
    }

    #[test]
    fn tokens_refill_over_the_window() {
        let limiter = HttpRateLimiter::new();
        let config = config(10, 10);
        let ip = addr("198.51.100.9");
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.check_at(ip, &config, start));
        }
        assert!(!limiter.check_at(ip, &config, start));
        assert!(limiter.check_at(ip, &config, start + Duration::from_secs(1)));
        assert!(!limiter.check_at(ip, &config, start + Duration::from_secs(1)));
    }

    #[test]
    fn refilled_buckets_are_pruned() {
        let limiter = HttpRateLimiter::new();
        let config = config(2, 10);
        let start = Instant::now();
        limiter.check_at(addr("198.51.100.10"), &config, start);

        assert_eq!(limiter.prune_full_at(&config, start), 0);
        assert_eq!(limiter.prune_full_at(&config, start + Duration::from_secs(10)), 1);
        assert_eq!(limiter.tracked(), 0);
    }
}
