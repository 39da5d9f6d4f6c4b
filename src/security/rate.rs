//! Per-IP sliding-window rate limiting.
//!
//! One process-wide instance guards admission. A single mutex covers the
//! whole map; the lock is held only for the duration of a check and
//! never across I/O. Sharding by IP hash would be a drop-in upgrade
//! behind the same interface if the lock ever becomes contended.

use crate::config::RateLimitConfig;
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Mutex,
    time::Instant,
};
use thiserror::Error;

/// A denied admission. All variants answer `429 Too Many Requests`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateDenied {
    /// The IP is inside an active block.
    #[error("temporarily blocked")]
    Blocked { retry_after: u64 },
    /// The main window filled up; a block has just been imposed.
    #[error("rate limit exceeded")]
    WindowExceeded { retry_after: u64 },
    /// Too many requests inside the burst window; no block imposed.
    #[error("burst limit exceeded")]
    BurstExceeded { retry_after: u64 },
}

impl RateDenied {
    /// Diagnostic line for the response body.
    pub fn reason(&self) -> &'static str {
        match self {
            RateDenied::Blocked { .. } => "temporarily blocked",
            RateDenied::WindowExceeded { .. } => "rate limit exceeded",
            RateDenied::BurstExceeded { .. } => "burst limit exceeded",
        }
    }

    /// Whole seconds for the `Retry-After` header.
    pub fn retry_after(&self) -> u64 {
        match self {
            RateDenied::Blocked { retry_after }
            | RateDenied::WindowExceeded { retry_after }
            | RateDenied::BurstExceeded { retry_after } => *retry_after,
        }
    }
}

#[derive(Debug, Default)]
struct ClientRecord {
    requests: VecDeque<Instant>,
    burst: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Thread-safe sliding-window limiter keyed by client IP.
///
/// Memory per tracked IP is bounded by
/// `requests_per_window + burst_requests` timestamps.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<IpAddr, ClientRecord>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check for `ip` at time `now`. The clock is an argument
    /// so tests can drive it.
    ///
    /// Order: active block, prune, main window (imposes a block), burst
    /// window (denies without extending any block), then record-and-allow.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), RateDenied> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = state.entry(ip).or_default();

        if let Some(until) = record.blocked_until {
            if now < until {
                return Err(RateDenied::Blocked {
                    retry_after: ceil_secs(until - now),
                });
            }
            record.blocked_until = None;
        }

        prune(&mut record.requests, now, self.config.window);
        prune(&mut record.burst, now, self.config.burst_window);

        if record.requests.len() >= self.config.requests_per_window {
            record.blocked_until = Some(now + self.config.block);
            return Err(RateDenied::WindowExceeded {
                retry_after: self.config.block.as_secs(),
            });
        }

        if record.burst.len() >= self.config.burst_requests {
            return Err(RateDenied::BurstExceeded {
                retry_after: ceil_secs(self.config.burst_window).max(1),
            });
        }

        record.requests.push_back(now);
        record.burst.push_back(now);
        Ok(())
    }
}

fn prune(deque: &mut VecDeque<Instant>, now: Instant, window: std::time::Duration) {
    while let Some(&front) = deque.front() {
        if now.duration_since(front) > window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

fn ceil_secs(d: std::time::Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
