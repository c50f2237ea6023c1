//! Token-bucket rate limiting keyed on client identity, with
//! trusted-proxy-aware client IP extraction.
//!
//! Mirrors the audio correlator's `Mutex<HashMap<key, state>>` shape
//! (`crate::audio`): one bucket per key, refilled lazily on each check
//! rather than by a background ticker.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A single named limiter (e.g. "guest_access", "share_link_create").
/// `capacity` tokens refill over `refill_period`.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_period: Duration) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec: capacity as f64 / refill_period.as_secs_f64(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes one token for `key`. Returns `true` if allowed, `false`
    /// if the bucket was empty.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Resolves the client identity used for rate limiting: the first
/// `X-Forwarded-For` hop when the connection arrived via a configured
/// trusted proxy, else the direct peer address.
pub fn client_identity(headers: &HeaderMap, peer: IpAddr, trusted_proxies: &[String]) -> String {
    let is_trusted = trusted_proxies.iter().any(|p| p == &peer.to_string());
    if is_trusted {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
    }
    peer.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let identity = client_identity(&headers, peer, &[]);
        assert_eq!(identity, "10.0.0.5");
    }

    #[test]
    fn trusted_proxy_forwards_original_client() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        let identity = client_identity(&headers, peer, &["10.0.0.5".to_string()]);
        assert_eq!(identity, "203.0.113.9");
    }
}
