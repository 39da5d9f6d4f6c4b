//! Observability plumbing: metric registration, request ids, and the
//! dedicated security-violation event channel.
//!
//! The core only talks to the `tracing` and `metrics` facades; the
//! binary decides which subscriber/recorder actually consumes them, and
//! tests can install their own.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use rand::{distributions::Alphanumeric, Rng};
use std::sync::OnceLock;

static METRICS_REGISTERED: OnceLock<()> = OnceLock::new();

/// Registers descriptions for every series the server emits. Idempotent.
pub fn register_metrics() {
    METRICS_REGISTERED.get_or_init(|| {
        describe_counter!("requests_total", "Requests served, labeled by status code");
        describe_counter!(
            "admission_rejections",
            "Requests refused before dispatch, labeled by reason"
        );
        describe_counter!(
            "pool_submissions_rejected",
            "Connections shed with 503 because the queue was full"
        );

        describe_gauge!("pool_queue_depth", "Connections waiting in the admission queue");
        describe_gauge!("pool_active_workers", "Workers currently serving a connection");

        describe_histogram!("request_duration_ms", "Wall-clock request duration");
        describe_histogram!("response_bytes", "Serialized response sizes");
    });
}

/// Short random id correlating the start/end log lines of one request.
pub(crate) fn request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Emits the dedicated security-violation event for an admission
/// rejection with probable attack intent (traversal, host spoofing).
pub(crate) fn security_violation(client: &str, request_line: &str, reason: &str) {
    tracing::warn!(
        target: "security",
        client,
        request_line,
        reason,
        "SECURITY_VIOLATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_short_and_distinct() {
        let a = request_id();
        let b = request_id();

        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn registration_is_idempotent() {
        register_metrics();
        register_metrics();
    }
}
