//! Per-IP rate limits for new connections and subscription filters.

use std::net::IpAddr;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero::nonzero;

pub struct Limits {
    connections: DefaultKeyedRateLimiter<IpAddr>,
    filters: DefaultKeyedRateLimiter<IpAddr>,
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

impl Limits {
    /// One connection per five minutes with a burst of 20; 20 filters a minute with a burst of 100.
    pub fn new() -> Self {
        Self {
            connections: RateLimiter::keyed(
                Quota::per_hour(nonzero!(12u32)).allow_burst(nonzero!(20u32)),
            ),
            filters: RateLimiter::keyed(
                Quota::per_minute(nonzero!(20u32)).allow_burst(nonzero!(100u32)),
            ),
        }
    }

    pub fn check_connection(&self, ip: IpAddr) -> bool {
        self.connections.check_key(&ip).is_ok()
    }

    pub fn check_filter(&self, ip: IpAddr) -> bool {
        self.filters.check_key(&ip).is_ok()
    }

    /// Forget addresses whose buckets have refilled.
    pub fn retain_recent(&self) {
        self.connections.retain_recent();
        self.filters.retain_recent();
    }
}
