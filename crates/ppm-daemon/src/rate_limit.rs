use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::http::HeaderMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

/// Per-IP webhook budget on a rolling minute (GCRA, so "rolling" rather
/// than calendar-minute buckets).
pub struct IpRateLimiter {
    limiter: Arc<RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>>,
}

impl IpRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute)
                .unwrap_or_else(|| NonZeroU32::new(100).expect("non-zero")),
        );
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// True when the request fits the caller's budget.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }
}

/// Caller IP: proxy header first (the tunnel in front of us sets it), then
/// the socket address, then loopback so local tooling is never rejected for
/// want of a header.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or(peer)
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}
