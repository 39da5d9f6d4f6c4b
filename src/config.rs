//! Server configuration.
//!
//! # Security-first defaults
//!
//! The default limits are intentionally conservative: they bound header
//! and body sizes, cap requests per connection, and time out idle peers
//! so a single client cannot pin a worker or exhaust memory.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration for one server run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (default: `127.0.0.1`).
    pub host: IpAddr,
    /// TCP port to listen on (default: `8080`).
    pub port: u16,

    /// Number of long-lived worker tasks (default: `10`, minimum 1).
    pub workers: usize,
    /// Capacity of the bounded connection queue between the accept loop
    /// and the workers (default: `32`, minimum 1). When the queue is
    /// full, new connections are shed with `503 Service Unavailable`.
    pub queue_capacity: usize,

    /// Idle read timeout per connection; also the per-request deadline
    /// for receiving headers and body (default: `30s`).
    pub idle_timeout: Duration,
    /// Per-write timeout on the socket (default: `3s`).
    pub write_timeout: Duration,
    /// Requests served on one connection before it is closed
    /// (default: `100`).
    pub max_requests_per_connection: usize,

    /// Maximum size of the request header block in bytes (default: `8192`).
    pub max_header_size: usize,
    /// Maximum request body size in bytes (default: `10 MiB`).
    pub max_body_size: usize,
    /// Maximum request-target length in bytes (default: `2048`).
    pub max_url_length: usize,

    /// Root directory of the static resource tree; must exist and be
    /// readable (default: `./resources`).
    pub resource_root: PathBuf,

    /// Host names accepted in the `Host` header, compared lowercased.
    /// Seeded with the bind host plus `localhost` and `127.0.0.1`.
    pub allowed_hosts: Vec<String>,

    /// Value of the `Server` response header.
    pub server_name: String,

    /// Per-client-IP admission limits.
    pub rate_limit: RateLimitConfig,
}

/// Sliding-window rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Allowed requests per `window` (default: `120`).
    pub requests_per_window: usize,
    /// Length of the main sliding window (default: `60s`).
    pub window: Duration,
    /// Allowed requests per `burst_window` (default: `30`).
    pub burst_requests: usize,
    /// Length of the short burst window (default: `2s`).
    pub burst_window: Duration,
    /// How long an offending IP stays blocked (default: `60s`).
    pub block: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 120,
            window: Duration::from_secs(60),
            burst_requests: 30,
            burst_window: Duration::from_secs(2),
            block: Duration::from_secs(60),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let host = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        Self {
            host,
            port: 8080,

            workers: 10,
            queue_capacity: 32,

            idle_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,

            max_header_size: 8192,
            max_body_size: 10 * 1024 * 1024,
            max_url_length: 2048,

            resource_root: PathBuf::from("resources"),

            allowed_hosts: default_allowed_hosts(host),

            server_name: concat!("warden_web/", env!("CARGO_PKG_VERSION")).to_string(),

            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Builds a config from the CLI triple, deriving the host whitelist
    /// from the bind address.
    pub fn new(host: IpAddr, port: u16, workers: usize) -> Self {
        Self {
            host,
            port,
            workers: workers.max(1),
            allowed_hosts: default_allowed_hosts(host),
            ..Self::default()
        }
    }

    /// The writable upload directory, a fixed child of the resource root.
    pub fn uploads_dir(&self) -> PathBuf {
        self.resource_root.join("uploads")
    }
}

fn default_allowed_hosts(host: IpAddr) -> Vec<String> {
    let mut hosts = vec![host.to_string().to_lowercase()];
    for name in ["localhost", "127.0.0.1"] {
        if !hosts.iter().any(|h| h == name) {
            hosts.push(name.to_string());
        }
    }
    hosts
}
