//! Host-header validation.
//!
//! Defends against Host-header confusion and cache-poisoning without a
//! vhost list: the request must carry exactly one `Host`, its name must
//! be whitelisted, and its port (when given) must match the listener.

use crate::{config::ServerConfig, errors::Reject, http::types::HeaderMap};

/// Checks the `Host` header against the configured whitelist.
///
/// - no `Host` header, or more than one, is a 400;
/// - the value splits on the rightmost `:` into name and port (a value
///   whose tail is not all digits, such as a bare IPv6 literal, is
///   treated as all-name);
/// - the lowercased name must appear in `allowed_hosts` and the port,
///   when present, must equal the listening port, else 403.
pub fn validate_host(headers: &HeaderMap, config: &ServerConfig) -> Result<(), Reject> {
    match headers.count("host") {
        0 => return Err(Reject::HostMissing),
        1 => {}
        _ => return Err(Reject::BadRequest("duplicate Host header")),
    }

    let value = headers.get("host").unwrap_or("");
    let (name, port) = split_host_port(value);

    if let Some(port) = port {
        let matches: bool = port
            .parse::<u16>()
            .map(|p| p == config.port)
            .unwrap_or(false);
        if !matches {
            return Err(Reject::HostMismatch);
        }
    }

    let name = name.trim_matches(['[', ']']).to_lowercase();
    if !config.allowed_hosts.iter().any(|h| *h == name) {
        return Err(Reject::HostMismatch);
    }

    Ok(())
}

/// Splits on the rightmost `:` when the tail looks like a port number.
/// `[v6]:port` unwraps its brackets; a bare multi-colon IPv6 literal is
/// all-name.
fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if let Some((name, tail)) = value.strip_prefix('[').and_then(|rest| rest.split_once(']')) {
        return (name, tail.strip_prefix(':'));
    }
    match value.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty()
                && !name.contains(':')
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (name, Some(port))
        }
        _ => (value, None),
    }
}
