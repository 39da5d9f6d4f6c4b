//! warden_web - a self-contained, hardened HTTP/1.1 origin server.
//!
//! Every byte between socket and disk is under direct control: requests
//! are parsed by hand, admission is defensive by default, and load is
//! shed at the edge instead of queueing without bound.
//!
//! # Architecture
//!
//! ```text
//! [ Accept loop ] --try_submit--> [ bounded queue ] --> [ N workers ]
//!        |                                                   |
//!        | queue full                                        v
//!        v                                 [ Connection: parse -> admit
//!   503 + close                              -> dispatch -> respond ]
//! ```
//!
//! Per request the admission order is fixed: size caps (enforced while
//! framing), Host validation, per-IP rate limiting, then - for GET -
//! path resolution beneath the read-only resource root. `POST /upload`
//! accepts small JSON documents and stores them atomically.
//!
//! # Defensive posture
//!
//! - header, body and URL size caps with an idle timeout per connection;
//! - at most 100 requests per keep-alive connection;
//! - traversal-proof path resolution (decode once, refuse `..`,
//!   canonicalize, containment check);
//! - Host-header whitelist pinned to the bind address;
//! - sliding-window rate limiter with burst detection and timed blocks;
//! - `503 Service Unavailable` shedding when the worker queue is full.
//!
//! # Quick start
//!
//! ```no_run
//! use warden_web::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let server = Server::bind(config).await.expect("startup");
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.shutdown();
//!     });
//!     server.run().await;
//! }
//! ```

pub mod http {
    pub mod request;
    pub mod response;
    pub mod types;
}
pub mod server {
    pub mod acceptor;
    pub(crate) mod connection;
    pub(crate) mod pool;
}
pub mod security {
    pub mod host;
    pub mod path;
    pub mod rate;
}
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod observe;

pub use crate::{
    config::{RateLimitConfig, ServerConfig},
    errors::{ParseError, Reject},
    http::{
        request::{parse_request, Request},
        response::Response,
        types::{HeaderMap, Method, StatusCode, Version},
    },
    security::{
        host::validate_host,
        path::resolve,
        rate::{RateDenied, RateLimiter},
    },
    server::acceptor::{Server, ServerHandle, StartupError},
    server::pool::PoolCounters,
};
