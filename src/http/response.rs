//! HTTP response construction and transmission.
//!
//! A [`Response`] collects a status, insertion-ordered headers and a
//! body; [`Response::serialize`] stamps the mandatory header set (`Date`,
//! `Server`, `Content-Type`, `Content-Length`, `Connection`, and
//! `Keep-Alive` when the connection stays open) and renders the byte
//! buffer. [`send_all`] pushes the buffer onto the socket in fixed-size
//! slices, each bounded by the write timeout.
//!
//! Framing is always `Content-Length`; the chunked *writes* here are a
//! socket strategy, not `Transfer-Encoding: chunked`.

use crate::http::types::StatusCode;
use chrono::Utc;
use std::{io, time::Duration};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::timeout};

/// Socket writes are sliced to this many bytes per `write_all`.
pub(crate) const WRITE_CHUNK_SIZE: usize = 8192;

/// One HTTP response under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    /// Final connection disposition; mirrored into the `Connection`
    /// header at serialization time.
    pub(crate) keep_alive: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::with_capacity(4),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Plain-text response: the standard shape for error bodies.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    /// Adds a header. `Date`, `Server`, `Content-Length`, `Connection`
    /// and `Keep-Alive` are stamped automatically; do not add them here.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Forces `Connection: close` on this response.
    pub fn close(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Renders the response: status line, headers in insertion order
    /// (mandatory set first), blank line, body.
    pub fn serialize(&self, server_name: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.status.status_line());

        push_header(&mut buf, "Date", &httpdate_now());
        push_header(&mut buf, "Server", server_name);
        for (name, value) in &self.headers {
            push_header(&mut buf, name, value);
        }
        if !self.headers.iter().any(|(n, _)| *n == "Content-Type") {
            push_header(&mut buf, "Content-Type", "text/plain; charset=utf-8");
        }
        push_header(&mut buf, "Content-Length", &self.body.len().to_string());
        if self.keep_alive {
            push_header(&mut buf, "Connection", "keep-alive");
            push_header(&mut buf, "Keep-Alive", "timeout=30, max=100");
        } else {
            push_header(&mut buf, "Connection", "close");
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        buf
    }
}

fn push_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// RFC-1123 UTC date, e.g. `Sun, 02 Aug 2026 09:15:00 GMT`.
fn httpdate_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Writes `buf` to the socket in [`WRITE_CHUNK_SIZE`] slices. Each slice
/// is written fully (short writes are retried inside `write_all`) within
/// `write_timeout`, or the transmission fails.
pub(crate) async fn send_all(
    stream: &mut TcpStream,
    buf: &[u8],
    write_timeout: Duration,
) -> io::Result<()> {
    for chunk in buf.chunks(WRITE_CHUNK_SIZE) {
        match timeout(write_timeout, stream.write_all(chunk)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(buf: &[u8]) -> &str {
        std::str::from_utf8(buf).unwrap()
    }

    fn header_value<'a>(serialized: &'a str, name: &str) -> Option<&'a str> {
        serialized.split("\r\n").find_map(|line| {
            let (n, v) = line.split_once(": ")?;
            (n == name).then_some(v)
        })
    }

    #[test]
    fn mandatory_headers_present() {
        let resp = Response::text(StatusCode::Ok, "hello");
        let buf = resp.serialize("warden_web/test");
        let text = text_of(&buf);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header_value(text, "Date").is_some());
        assert_eq!(header_value(text, "Server"), Some("warden_web/test"));
        assert_eq!(
            header_value(text, "Content-Type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(header_value(text, "Content-Length"), Some("5"));
        assert_eq!(header_value(text, "Connection"), Some("keep-alive"));
        assert_eq!(
            header_value(text, "Keep-Alive"),
            Some("timeout=30, max=100")
        );
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn close_disposition() {
        let resp = Response::text(StatusCode::BadRequest, "bad").close();
        let text_buf = resp.serialize("s");
        let text = text_of(&text_buf);

        assert_eq!(header_value(text, "Connection"), Some("close"));
        assert_eq!(header_value(text, "Keep-Alive"), None);
    }

    #[test]
    fn content_type_defaults_when_missing() {
        let resp = Response::new(StatusCode::NoContent);
        let buf = resp.serialize("s");
        let text = text_of(&buf);

        assert_eq!(
            header_value(text, "Content-Type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(header_value(text, "Content-Length"), Some("0"));
    }

    #[test]
    fn custom_headers_keep_insertion_order() {
        let resp = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/pdf")
            .header("Content-Disposition", "inline")
            .with_body(b"%PDF".to_vec());
        let buf = resp.serialize("s");
        let text = text_of(&buf);

        let ct = text.find("Content-Type:").unwrap();
        let cd = text.find("Content-Disposition:").unwrap();
        assert!(ct < cd);
        assert_eq!(header_value(text, "Content-Length"), Some("4"));
        // The explicit content type wins; no duplicate default is added.
        assert_eq!(text.matches("Content-Type:").count(), 1);
    }

    #[test]
    fn date_is_rfc1123_shaped() {
        let buf = Response::text(StatusCode::Ok, "x").serialize("s");
        let date = header_value(text_of(&buf), "Date").unwrap().to_string();

        // e.g. "Sun, 02 Aug 2026 09:15:00 GMT"
        assert!(date.ends_with(" GMT"), "{date}");
        assert_eq!(date.len(), 29, "{date}");
        assert_eq!(&date[3..5], ", ");
    }
}
