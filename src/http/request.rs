//! Manual HTTP/1.1 request framing.
//!
//! [`parse_request`] consumes one complete header block (everything up to
//! and including the `\r\n\r\n` terminator, accumulated by the connection
//! handler) and produces a [`Request`]. The body is read separately by
//! the caller, exactly `Content-Length` bytes, and attached afterwards.

use crate::{
    config::ServerConfig,
    errors::ParseError,
    http::types::{is_tchar, HeaderMap, Method, Version},
};
use memchr::memchr;

/// One parsed HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Raw request target as it appeared on the wire.
    pub target: String,
    /// Target with the query string stripped.
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// Validated `Content-Length`, when the header was present.
    pub content_length: Option<usize>,
    /// Exactly `content_length` bytes, filled in by the connection
    /// handler after the header block is parsed.
    pub body: Vec<u8>,
    /// The verbatim request line, kept for logging and security events.
    pub request_line: String,
}

impl Request {
    /// Keep-alive as requested by the client: HTTP/1.1 defaults to
    /// keep-alive unless `Connection` carries a `close` token, HTTP/1.0
    /// defaults to close unless it carries `keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        let tokens = self.headers.get("connection").unwrap_or("");
        match self.version {
            Version::Http11 => !has_token(tokens, "close"),
            Version::Http10 => has_token(tokens, "keep-alive"),
        }
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Parses a complete header block into a [`Request`] with an empty body.
///
/// `head` must end with `\r\n\r\n`; the connection handler guarantees
/// this before calling.
pub fn parse_request(head: &[u8], config: &ServerConfig) -> Result<Request, ParseError> {
    let mut lines = HeadLines { rest: head };

    let request_line = lines
        .next_line()?
        .ok_or(ParseError::BadRequest("empty request"))?;
    let (method, target, version) = parse_request_line(request_line, config)?;

    let mut headers = HeaderMap::with_capacity(16);
    loop {
        let Some(line) = lines.next_line()? else {
            return Err(ParseError::BadRequest("missing header terminator"));
        };
        if line.is_empty() {
            break;
        }
        parse_header_line(line, &mut headers)?;
    }

    let content_length = parse_content_length(&headers, config)?;
    check_transfer_encoding(&headers)?;

    let target = String::from_utf8(target.to_vec())
        .map_err(|_| ParseError::BadRequest("invalid request target"))?;
    let path = match target.find('?') {
        Some(q) => target[..q].to_string(),
        None => target.clone(),
    };

    Ok(Request {
        request_line: String::from_utf8_lossy(request_line).into_owned(),
        method,
        target,
        path,
        version,
        headers,
        content_length,
        body: Vec::new(),
    })
}

/// Iterator over CRLF-terminated lines; a bare LF is a framing error.
struct HeadLines<'a> {
    rest: &'a [u8],
}

impl<'a> HeadLines<'a> {
    fn next_line(&mut self) -> Result<Option<&'a [u8]>, ParseError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let nl = match memchr(b'\n', self.rest) {
            Some(i) => i,
            None => return Err(ParseError::BadRequest("unterminated header line")),
        };
        if nl == 0 || self.rest[nl - 1] != b'\r' {
            return Err(ParseError::BadRequest("bare LF in header block"));
        }
        let line = &self.rest[..nl - 1];
        self.rest = &self.rest[nl + 1..];
        Ok(Some(line))
    }
}

fn parse_request_line<'a>(
    line: &'a [u8],
    config: &ServerConfig,
) -> Result<(Method, &'a [u8], Version), ParseError> {
    // Exactly three tokens separated by single spaces; empty tokens mean
    // doubled or leading/trailing spaces.
    let mut parts = line.split(|&b| b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(ParseError::BadRequest("malformed request line")),
    };

    if method.is_empty() || !method.iter().all(u8::is_ascii_alphabetic) {
        return Err(ParseError::BadRequest("malformed method"));
    }
    if target.is_empty() {
        return Err(ParseError::BadRequest("malformed request line"));
    }
    if target.len() > config.max_url_length {
        return Err(ParseError::UriTooLong);
    }

    // HTTP/<d>.<d> shape first, then the supported-version check.
    let well_formed = version.len() == 8
        && version.starts_with(b"HTTP/")
        && version[5].is_ascii_digit()
        && version[6] == b'.'
        && version[7].is_ascii_digit();
    if !well_formed {
        return Err(ParseError::BadRequest("malformed protocol version"));
    }
    let version = Version::from_bytes(version)
        .ok_or(ParseError::BadRequest("unsupported protocol version"))?;

    Ok((Method::from_token(method), target, version))
}

fn parse_header_line(line: &[u8], headers: &mut HeaderMap) -> Result<(), ParseError> {
    // Obsolete line folding (RFC 7230 §3.2.4) is rejected outright.
    if line[0] == b' ' || line[0] == b'\t' {
        return Err(ParseError::BadRequest("obsolete header folding"));
    }

    let colon = memchr(b':', line).ok_or(ParseError::BadRequest("malformed header line"))?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
        return Err(ParseError::BadRequest("malformed header name"));
    }

    let value = trim_ows(&line[colon + 1..]);

    headers.push(
        String::from_utf8_lossy(name).to_ascii_lowercase(),
        String::from_utf8_lossy(value).into_owned(),
    );
    Ok(())
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_content_length(
    headers: &HeaderMap,
    config: &ServerConfig,
) -> Result<Option<usize>, ParseError> {
    let Some(raw) = headers.get("content-length") else {
        return Ok(None);
    };

    // Plain decimal: no sign, no whitespace, no leading zeros beyond a
    // single "0".
    let bytes = raw.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.iter().all(u8::is_ascii_digit)
        && !(bytes.len() > 1 && bytes[0] == b'0');
    if !valid {
        return Err(ParseError::BadRequest("invalid Content-Length"));
    }

    let len: usize = raw
        .parse()
        .map_err(|_| ParseError::BadRequest("invalid Content-Length"))?;
    if len > config.max_body_size {
        return Err(ParseError::BodyTooLarge);
    }
    Ok(Some(len))
}

fn check_transfer_encoding(headers: &HeaderMap) -> Result<(), ParseError> {
    match headers.get("transfer-encoding") {
        None => Ok(()),
        Some(value) if value.trim().eq_ignore_ascii_case("identity") => Ok(()),
        Some(_) => Err(ParseError::BadRequest("transfer encoding not supported")),
    }
}
