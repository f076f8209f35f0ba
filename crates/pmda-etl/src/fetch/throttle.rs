//! Request spacing toward remote origins
//!
//! A [`Throttle`] is injected into the fetcher as an `Arc`, so every
//! pipeline in the process shares one limiter per origin. Tests substitute
//! [`Unthrottled`].

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until a request to `origin` may be sent
    async fn acquire(&self, origin: &str);
}

/// No spacing at all
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

#[async_trait]
impl Throttle for Unthrottled {
    async fn acquire(&self, _origin: &str) {}
}

/// One token bucket per origin, one request per interval, no burst
pub struct OriginThrottle {
    default_interval: Duration,
    intervals: HashMap<String, Duration>,
    limiters: Mutex<HashMap<String, Arc<DefaultDirectRateLimiter>>>,
}

impl OriginThrottle {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            intervals: HashMap::new(),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Declare the spacing wanted for an origin; the slowest declaration wins
    pub fn register(&mut self, origin: &str, interval: Duration) {
        let slot = self
            .intervals
            .entry(origin.to_string())
            .or_insert(interval);
        if interval > *slot {
            *slot = interval;
        }
    }

    pub fn interval_for(&self, origin: &str) -> Duration {
        self.intervals
            .get(origin)
            .copied()
            .unwrap_or(self.default_interval)
    }

    fn limiter(&self, origin: &str) -> Option<Arc<DefaultDirectRateLimiter>> {
        let quota = Quota::with_period(self.interval_for(origin))?;
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        let limiter = limiters
            .entry(origin.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)));
        Some(Arc::clone(limiter))
    }
}

#[async_trait]
impl Throttle for OriginThrottle {
    async fn acquire(&self, origin: &str) {
        if let Some(limiter) = self.limiter(origin) {
            limiter.until_ready().await;
        }
    }
}

/// Scheme, host and port of a URL, the unit requests are spaced by
pub fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://www.pmda.go.jp/files/000123.csv?x=1"),
            "https://www.pmda.go.jp"
        );
        assert_eq!(origin_of("http://localhost:8080/a"), "http://localhost:8080");
    }

    #[test]
    fn test_register_keeps_slowest_interval() {
        let mut throttle = OriginThrottle::new(Duration::from_secs(1));
        throttle.register("https://a", Duration::from_millis(200));
        throttle.register("https://a", Duration::from_millis(500));
        throttle.register("https://a", Duration::from_millis(100));

        assert_eq!(throttle.interval_for("https://a"), Duration::from_millis(500));
        assert_eq!(throttle.interval_for("https://b"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requests_to_one_origin_are_spaced() {
        let throttle = OriginThrottle::new(Duration::from_millis(60));
        let start = Instant::now();
        for _ in 0..3 {
            throttle.acquire("https://www.pmda.go.jp").await;
        }
        assert!(start.elapsed() >= Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_origins_do_not_share_a_bucket() {
        let throttle = OriginThrottle::new(Duration::from_secs(30));
        let start = Instant::now();
        throttle.acquire("https://a.example").await;
        throttle.acquire("https://b.example").await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_interval_disables_spacing() {
        let throttle = OriginThrottle::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..10 {
            throttle.acquire("https://a.example").await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
