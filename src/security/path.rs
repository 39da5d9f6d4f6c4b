//! Path resolution with traversal defence.
//!
//! Every GET path goes through [`resolve`] before any filesystem I/O:
//! one pass of percent-decoding, normalization that refuses `..` and
//! absolute shapes, then canonicalization to catch symlink escapes.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a request path was refused. All variants map to `403 Forbidden`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathDenied {
    #[error("path traversal detected")]
    Traversal,
    #[error("absolute path not allowed")]
    AbsolutePath,
    #[error("resolved path escapes the resource root")]
    Escape,
}

/// Resolves a request path to a file beneath `root`.
///
/// Steps, in order: strip any query/fragment; percent-decode once; strip
/// leading slashes and backslashes; reject drive-letter prefixes; split
/// on both separators, dropping empty and `.` segments and refusing any
/// `..`; rejoin beneath `root`; canonicalize and require the result to
/// stay inside the canonical root.
///
/// A path that survives normalization but does not exist on disk is
/// returned as-is so the caller can answer 404; nothing that reaches the
/// filesystem can point outside `root`.
pub fn resolve(request_path: &str, root: &Path) -> Result<PathBuf, PathDenied> {
    let path = request_path
        .split(['?', '#'])
        .next()
        .unwrap_or("");
    let decoded = percent_decode(path);

    let trimmed = decoded.trim_start_matches(['/', '\\']);
    if has_drive_prefix(trimmed) {
        return Err(PathDenied::AbsolutePath);
    }

    let mut segments = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathDenied::Traversal),
            s => segments.push(s),
        }
    }

    let mut joined = root.to_path_buf();
    for segment in &segments {
        joined.push(segment);
    }

    match joined.canonicalize() {
        Ok(real) => {
            let base = root.canonicalize().map_err(|_| PathDenied::Escape)?;
            if real.starts_with(&base) {
                Ok(real)
            } else {
                Err(PathDenied::Escape)
            }
        }
        // Nothing at that path: hand it back so the caller reports 404.
        Err(_) => Ok(joined),
    }
}

/// `C:\...` or `C:/...` after decoding.
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Decodes `%xx` escapes in a single pass; invalid sequences pass
/// through unchanged.
pub(crate) fn percent_decode(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    out.push(hi << 4 | lo);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
