//! Shared helpers for the integration tests: spawn a real server on an
//! ephemeral port over a throwaway resource tree and speak raw HTTP/1.1
//! to it.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warden_web::{PoolCounters, Server, ServerConfig, ServerHandle};

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub root: tempfile::TempDir,
    run: tokio::task::JoinHandle<PoolCounters>,
}

impl TestServer {
    /// Stops the server and waits for the drain.
    pub async fn stop(self) {
        self.handle.shutdown();
        let _ = self.run.await;
    }
}

/// Seeds a resource tree with the fixtures the scenarios expect.
pub fn seed_resources(root: &std::path::Path) {
    std::fs::write(root.join("index.html"), b"<html><body>home</body></html>").unwrap();
    std::fs::write(root.join("logo.png"), PNG_BYTES).unwrap();
    std::fs::write(root.join("readme.txt"), b"plain text file").unwrap();
    std::fs::create_dir_all(root.join("uploads")).unwrap();
}

pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0xde, 0xad, 0xbe, 0xef,
];

/// Starts a server with the default configuration (tuned by `tune`) on
/// 127.0.0.1:0.
pub async fn start_server(tune: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    seed_resources(root.path());

    let mut config = ServerConfig::new("127.0.0.1".parse().unwrap(), 0, 4);
    config.resource_root = root.path().to_path_buf();
    config.idle_timeout = Duration::from_secs(5);
    tune(&mut config);

    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    let run = tokio::spawn(server.run());

    TestServer {
        addr,
        handle,
        root,
        run,
    }
}

/// One complete HTTP response off the wire.
#[derive(Debug)]
pub struct WireResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.split("\r\n").find_map(|line| {
            let (n, v) = line.split_once(": ")?;
            n.eq_ignore_ascii_case(name).then_some(v)
        })
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads exactly one response: headers to `\r\n\r\n`, then
/// `Content-Length` body bytes.
pub async fn read_response(stream: &mut TcpStream) -> WireResponse {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find_terminator(&buf) {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let content_length: usize = head
        .split("\r\n")
        .find_map(|line| {
            let (n, v) = line.split_once(": ")?;
            n.eq_ignore_ascii_case("content-length").then_some(v)
        })
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    WireResponse { status, head, body }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Connects, writes `raw`, reads one response.
pub async fn send_raw(addr: SocketAddr, raw: &str) -> WireResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_response(&mut stream).await
}

/// A plain GET with a matching Host header.
pub fn get_request(addr: SocketAddr, path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", addr.port())
}
