//! Per-connection keep-alive handling.
//!
//! A worker owns one socket at a time and drives it through the request
//! loop: accumulate a header block, parse, admit, dispatch, respond,
//! then decide whether the connection survives. Every rejection funnels
//! through one mapper so the status/close table lives in a single place.

use crate::{
    config::ServerConfig,
    dispatch::{self, ALLOWED_METHODS},
    errors::Reject,
    http::{
        request::{parse_request, Request},
        response::{send_all, Response},
        types::Method,
    },
    observe,
    security::{host::validate_host, rate::RateLimiter},
    server::pool::Conn,
};
use memchr::memmem;
use metrics::{counter, histogram};
use std::{io, net::SocketAddr, time::Instant};
use tokio::{io::AsyncReadExt, net::TcpStream, sync::watch, time::timeout};

/// Shared read-only state handed to every worker.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) limiter: RateLimiter,
}

/// Socket reads happen in slices of this size.
const READ_CHUNK_SIZE: usize = 1024;

enum HeadError {
    /// Header block grew past the cap without a terminator.
    TooLarge,
    /// Peer went away or stalled mid-request.
    Partial,
    Io(io::Error),
}

/// Serves one connection until it closes. Returns `Err` only for socket
/// failures; protocol errors are answered in-band and are not failures
/// of the worker.
pub(crate) async fn serve(
    conn: Conn,
    state: &ServerState,
    shutdown: &watch::Receiver<bool>,
) -> io::Result<()> {
    let Conn { mut stream, peer } = conn;
    let config = &state.config;
    let client = peer.to_string();
    let mut shutdown = shutdown.clone();

    // Bytes read past the current frame: body first, then any early
    // bytes of the next request on a kept-alive connection.
    let mut buffer: Vec<u8> = Vec::new();
    let mut served = 0usize;

    loop {
        let head_len = match read_header_block(&mut stream, &mut buffer, config, &mut shutdown).await
        {
            Ok(Some(n)) => n,
            Ok(None) => break,
            Err(HeadError::TooLarge) => {
                answer_early_reject(
                    &mut stream,
                    config,
                    &client,
                    Reject::BadRequest("header block too large"),
                )
                .await;
                break;
            }
            Err(HeadError::Partial) => {
                answer_early_reject(
                    &mut stream,
                    config,
                    &client,
                    Reject::BadRequest("incomplete request"),
                )
                .await;
                break;
            }
            Err(HeadError::Io(e)) => return Err(e),
        };

        let started = Instant::now();
        let request_id = observe::request_id();

        let rest = buffer.split_off(head_len);
        let head = std::mem::replace(&mut buffer, rest);

        let mut request = match parse_request(&head, config) {
            Ok(request) => request,
            Err(e) => {
                answer_early_reject(&mut stream, config, &client, Reject::from(e)).await;
                break;
            }
        };

        if let Some(len) = request.content_length {
            match read_exact_body(&mut stream, &mut buffer, len, config).await {
                Ok(body) => request.body = body,
                Err(HeadError::Io(e)) => return Err(e),
                Err(_) => {
                    answer_early_reject(
                        &mut stream,
                        config,
                        &client,
                        Reject::BadRequest("request body incomplete"),
                    )
                    .await;
                    break;
                }
            }
        }

        tracing::info!(
            request_id = %request_id,
            client = %client,
            method = ?request.method,
            target = %request.target,
            "request received"
        );

        let client_keep_alive = request.wants_keep_alive();

        // The method gate answers before any admission check runs: an
        // unknown method is 405 even from a throttled or wrong-Host peer.
        let verdict = if matches!(request.method, Method::Get | Method::Post | Method::Options) {
            match admit(&request, state, peer, &client) {
                Ok(()) => dispatch::dispatch(&request, config, &client).await,
                Err(reject) => Err(reject),
            }
        } else {
            Err(Reject::MethodNotAllowed)
        };

        let (response, must_close) = match verdict {
            Ok(response) => (response, false),
            Err(reject) => {
                record_rejection(&reject, &request_id, &client);
                (reject_response(&reject), reject.closes_connection())
            }
        };

        served += 1;
        let keep = !must_close
            && client_keep_alive
            && served < config.max_requests_per_connection
            && !*shutdown.borrow();
        let response = if keep { response } else { response.close() };

        let status = response.status();
        let wire = response.serialize(&config.server_name);
        if let Err(e) = send_all(&mut stream, &wire, config.write_timeout).await {
            tracing::error!(request_id = %request_id, client = %client, error = %e, "response write failed");
            return Err(e);
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        counter!("requests_total", "status" => status.code().to_string()).increment(1);
        histogram!("request_duration_ms").record(duration_ms);
        histogram!("response_bytes").record(wire.len() as f64);
        tracing::info!(
            request_id = %request_id,
            client = %client,
            status = status.code(),
            bytes = wire.len(),
            duration_ms,
            "request completed"
        );

        if !keep {
            break;
        }
    }

    Ok(())
}

/// Host check, then rate check. Sizes were already enforced while the
/// request was framed.
fn admit(
    request: &Request,
    state: &ServerState,
    peer: SocketAddr,
    client: &str,
) -> Result<(), Reject> {
    validate_host(&request.headers, &state.config).map_err(|reject| {
        if reject == Reject::HostMismatch {
            observe::security_violation(client, &request.request_line, "host not allowed");
        }
        reject
    })?;

    state
        .limiter
        .check(peer.ip(), Instant::now())
        .map_err(|denied| Reject::RateLimited {
            reason: denied.reason(),
            retry_after: denied.retry_after(),
        })?;

    Ok(())
}

/// Accumulates bytes until the `\r\n\r\n` terminator. `Ok(Some(n))` is
/// the length of the header block including the terminator; `Ok(None)`
/// means the peer closed or idled out without starting a request.
///
/// The wait also wakes on the shutdown signal so idle keep-alive
/// connections release their worker promptly instead of sitting out the
/// idle timeout.
async fn read_header_block(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
    config: &ServerConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<usize>, HeadError> {
    loop {
        if let Some(idx) = memmem::find(buffer, b"\r\n\r\n") {
            return Ok(Some(idx + 4));
        }
        if buffer.len() > config.max_header_size {
            return Err(HeadError::TooLarge);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = tokio::select! {
            r = timeout(config.idle_timeout, stream.read(&mut chunk)) => r,
            _ = shutdown_signalled(shutdown) => {
                return match buffer.is_empty() {
                    true => Ok(None),
                    false => Err(HeadError::Partial),
                };
            }
        };

        match read {
            Ok(Ok(0)) => {
                return match buffer.is_empty() {
                    true => Ok(None),
                    false => Err(HeadError::Partial),
                };
            }
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(HeadError::Io(e)),
            // Idle timeout: silent close unless a partial request arrived.
            Err(_) => {
                return match buffer.is_empty() {
                    true => Ok(None),
                    false => Err(HeadError::Partial),
                };
            }
        }
    }
}

/// Resolves once the stop flag is set; pends forever if the sender is
/// gone without ever having signalled.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Reads until `buffer` holds at least `len` body bytes, then drains
/// exactly that many. The length was already validated against the body
/// cap when `Content-Length` was parsed.
async fn read_exact_body(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
    len: usize,
    config: &ServerConfig,
) -> Result<Vec<u8>, HeadError> {
    while buffer.len() < len {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match timeout(config.idle_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(HeadError::Partial),
            Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(HeadError::Io(e)),
            Err(_) => return Err(HeadError::Partial),
        }
    }
    Ok(buffer.drain(..len).collect())
}

/// Builds the response for a rejection: status, diagnostic body, and the
/// rejection-specific headers (`Allow`, `Retry-After`).
fn reject_response(reject: &Reject) -> Response {
    let body = format!("{}: {}", reject.status().reason(), reject);
    let response = Response::text(reject.status(), body);
    match reject {
        Reject::MethodNotAllowed => response.header("Allow", ALLOWED_METHODS),
        Reject::RateLimited { retry_after, .. } => {
            response.header("Retry-After", retry_after.to_string())
        }
        _ => response,
    }
}

fn record_rejection(reject: &Reject, request_id: &str, client: &str) {
    if reject.is_admission() {
        counter!("admission_rejections", "reason" => reject.metric_reason()).increment(1);
    }
    tracing::warn!(
        request_id,
        client = %client,
        reason = reject.metric_reason(),
        status = reject.status().code(),
        "request rejected"
    );
}

/// Best-effort rejection before a request was fully framed; the
/// connection always closes afterwards.
async fn answer_early_reject(
    stream: &mut TcpStream,
    config: &ServerConfig,
    client: &str,
    reject: Reject,
) {
    record_rejection(&reject, "-", client);
    counter!("requests_total", "status" => reject.status().code().to_string()).increment(1);
    let wire = reject_response(&reject).close().serialize(&config.server_name);
    let _ = send_all(stream, &wire, config.write_timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    struct Harness {
        addr: SocketAddr,
        _root: tempfile::TempDir,
    }

    async fn harness(tune: impl FnOnce(&mut ServerConfig)) -> Harness {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), b"<h1>hello</h1>").unwrap();
        std::fs::create_dir(root.path().join("uploads")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = ServerConfig::new("127.0.0.1".parse().unwrap(), addr.port(), 1);
        config.resource_root = root.path().to_path_buf();
        config.idle_timeout = Duration::from_millis(500);
        tune(&mut config);

        let limiter = RateLimiter::new(config.rate_limit.clone());
        let state = Arc::new(ServerState { config, limiter });

        // One worker inline: accept a single connection and serve it.
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (tx, rx) = watch::channel(false);
            let _ = serve(Conn { stream, peer }, &state, &rx).await;
            drop(tx);
        });

        Harness { addr, _root: root }
    }

    async fn roundtrip(h: &Harness, raw: &str) -> String {
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_index_over_the_wire() {
        let h = harness(|_| {}).await;
        let raw = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n", h.addr.port());
        let reply = roundtrip(&h, &raw).await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("Content-Type: text/html; charset=utf-8"));
        assert!(reply.contains("Connection: close"));
        assert!(reply.ends_with("<h1>hello</h1>"));
    }

    #[tokio::test]
    async fn malformed_request_line_closes_with_400() {
        let h = harness(|_| {}).await;
        let reply = roundtrip(&h, "GARBAGE\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
        assert!(reply.contains("Connection: close"));
    }

    #[tokio::test]
    async fn missing_host_is_400() {
        let h = harness(|_| {}).await;
        let reply = roundtrip(&h, "GET / HTTP/1.1\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
        assert!(reply.contains("missing Host header"));
    }

    #[tokio::test]
    async fn host_mismatch_is_403() {
        let h = harness(|_| {}).await;
        let reply = roundtrip(&h, "GET / HTTP/1.1\r\nHost: evil.com\r\n\r\n").await;

        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{reply}");
        assert!(reply.contains("Connection: close"));
    }

    #[tokio::test]
    async fn unsupported_method_keeps_connection() {
        let h = harness(|_| {}).await;
        let port = h.addr.port();

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client
            .write_all(format!("PUT / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();

        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{reply}");
        assert!(reply.contains("Allow: GET, POST, OPTIONS"));
        assert!(reply.contains("Connection: keep-alive"));

        // Connection survives for the next request.
        client
            .write_all(
                format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(String::from_utf8_lossy(&rest).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn unknown_method_beats_host_validation() {
        let h = harness(|_| {}).await;

        // The Host would fail validation; the method gate answers first.
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client
            .write_all(b"PUT / HTTP/1.1\r\nHost: evil.com\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();

        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{reply}");
        assert!(reply.contains("Allow: GET, POST, OPTIONS"));
        // 405 keeps the connection even when admission would have closed it.
        assert!(reply.contains("Connection: keep-alive"));
    }

    #[tokio::test]
    async fn unknown_method_beats_rate_limiting() {
        let h = harness(|c| {
            c.rate_limit.burst_requests = 1;
            c.rate_limit.burst_window = Duration::from_secs(60);
        })
        .await;
        let port = h.addr.port();

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client
            .write_all(format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));

        // The IP is now throttled, but an unknown method still gets 405,
        // not 429.
        client
            .write_all(format!("DELETE / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(reply.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{reply}");
        assert!(reply.contains("Connection: keep-alive"));
    }

    #[tokio::test]
    async fn request_budget_closes_connection() {
        let h = harness(|c| c.max_requests_per_connection = 2).await;
        let port = h.addr.port();

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        let get = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");

        client.write_all(get.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let first = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(first.contains("Connection: keep-alive"), "{first}");
        assert!(first.contains("Keep-Alive: timeout=30, max=100"));

        // Second request exhausts the budget: the server answers with
        // close and drops the connection.
        client.write_all(get.as_bytes()).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        let second = String::from_utf8_lossy(&rest).into_owned();
        assert!(second.contains("Connection: close"), "{second}");
    }

    #[tokio::test]
    async fn post_body_split_across_writes() {
        let h = harness(|_| {}).await;
        let port = h.addr.port();

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n"
        );
        client.write_all(head.as_bytes()).await.unwrap();
        client.write_all(b"{\"hello\":").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(b"\"world\"}").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let reply = String::from_utf8_lossy(&out).into_owned();
        assert!(reply.starts_with("HTTP/1.1 201 Created\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn oversized_header_block_is_400() {
        let h = harness(|c| c.max_header_size = 256).await;
        let filler = format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Filler: {}\r\n\r\n",
            "a".repeat(512)
        );
        let reply = roundtrip(&h, &filler).await;

        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
        assert!(reply.contains("header block too large"));
    }

    #[tokio::test]
    async fn partial_request_times_out_with_400() {
        let h = harness(|c| c.idle_timeout = Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(b"GET / HTT").await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let reply = String::from_utf8_lossy(&out).into_owned();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
    }

    #[tokio::test]
    async fn rate_limited_request_gets_429() {
        let h = harness(|c| {
            c.rate_limit.burst_requests = 1;
            c.rate_limit.burst_window = Duration::from_secs(60);
        })
        .await;
        let port = h.addr.port();
        let get = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(get.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200 OK"));

        client.write_all(get.as_bytes()).await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(reply.starts_with("HTTP/1.1 429 Too Many Requests\r\n"), "{reply}");
        assert!(reply.contains("Retry-After:"));
        // Rate-limit denial keeps the connection open.
        assert!(reply.contains("Connection: keep-alive"));
    }
}
