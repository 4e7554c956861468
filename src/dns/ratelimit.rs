//! Per-subnet rate limiting for plain DNS queries.
//!
//! Clients are bucketed by subnet (/24 for IPv4, /56 for IPv6) so that a
//! single host rotating through addresses in its own network cannot dodge
//! the limit. Counting uses a fixed one-second window per subnet.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use tracing::debug;

/// Subnet sizes queries are aggregated on.
const SUBNET_PREFIX_V4: u8 = 24;
const SUBNET_PREFIX_V6: u8 = 56;

/// Length of the counting window.
const WINDOW: Duration = Duration::from_secs(1);

/// Map size that triggers a purge of stale windows.
const PURGE_THRESHOLD: usize = 1024;

/// Queries-per-second limiter keyed by client subnet.
pub struct RateLimiter {
    /// Maximum queries per window per subnet. 0 disables limiting.
    limit: u32,
    /// Client addresses excluded from rate limiting.
    allowlist: Vec<IpAddr>,
    windows: Mutex<HashMap<IpAddr, Window>>,
}

struct Window {
    started_at: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, allowlist: Vec<IpAddr>) -> Self {
        Self {
            limit,
            allowlist,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when a query from `client` may be processed.
    pub fn allow(&self, client: IpAddr) -> bool {
        if self.limit == 0 || self.allowlist.contains(&client) {
            return true;
        }

        let key = subnet_key(client);
        let now = Instant::now();

        let mut windows = self.windows.lock().unwrap();

        if windows.len() > PURGE_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.started_at) <= WINDOW);
        }

        let window = windows.entry(key).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.duration_since(window.started_at) > WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        window.count += 1;
        let allowed = window.count <= self.limit;
        if !allowed {
            debug!("dns: rate limit exceeded for subnet {}", key);
        }

        allowed
    }
}

/// Truncates a client address to its rate-limiting subnet.
fn subnet_key(ip: IpAddr) -> IpAddr {
    let prefix = match ip {
        IpAddr::V4(_) => SUBNET_PREFIX_V4,
        IpAddr::V6(_) => SUBNET_PREFIX_V6,
    };

    IpNetwork::new(ip, prefix)
        .map(|net| net.network())
        .unwrap_or(ip)
}
