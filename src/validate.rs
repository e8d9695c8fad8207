//! Cross-cutting validation of free-form inputs: request path splitting,
//! label colors, timestamps, and identifier bounds.

use chrono::{DateTime, Utc};

use crate::errors::{ForgeError, Result};

/// Maximum byte length accepted for any free-form identifier.
pub const MAX_IDENT_BYTES: usize = 255;

/// Percent-decode and split a request path like `/repos/{owner}/{repo}/...`
/// into its segments.
///
/// Rejects `..` segments, NUL bytes, and empty interior segments. A single
/// leading slash is tolerated; everything else must be non-empty.
pub fn split_request_path(path: &str) -> Result<Vec<String>> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(ForgeError::InvalidInput("empty request path".into()));
    }
    let mut segments = Vec::new();
    for raw in trimmed.split('/') {
        if raw.is_empty() {
            return Err(ForgeError::InvalidInput("empty path segment".into()));
        }
        let decoded = percent_decode(raw)?;
        if decoded == ".." || decoded == "." {
            return Err(ForgeError::InvalidInput(format!(
                "forbidden path segment: {decoded}"
            )));
        }
        if decoded.as_bytes().contains(&0) {
            return Err(ForgeError::InvalidInput("NUL in path segment".into()));
        }
        bounded_ident(&decoded)?;
        segments.push(decoded);
    }
    Ok(segments)
}

/// Strict percent-decoding. Malformed escapes and encoded NUL/CR/LF are
/// rejected rather than passed through.
pub fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(ForgeError::InvalidInput("truncated percent escape".into()));
            }
            let hi = hex_val(bytes[i + 1])?;
            let lo = hex_val(bytes[i + 2])?;
            let b = (hi << 4) | lo;
            if b == 0 || b == b'\n' || b == b'\r' {
                return Err(ForgeError::InvalidInput(
                    "control byte in percent escape".into(),
                ));
            }
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ForgeError::InvalidInput("invalid UTF-8 in path".into()))
}

fn hex_val(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(ForgeError::InvalidInput("invalid hex digit".into())),
    }
}

/// Label colors must be `#` followed by exactly six hex digits.
pub fn validate_label_color(color: &str) -> Result<()> {
    let rest = color
        .strip_prefix('#')
        .ok_or_else(|| ForgeError::InvalidInput(format!("label color must start with #: {color}")))?;
    if rest.len() != 6 || !rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ForgeError::InvalidInput(format!(
            "label color must be six hex digits: {color}"
        )));
    }
    Ok(())
}

/// Strict ISO-8601 / RFC 3339 timestamp parsing.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ForgeError::InvalidInput(format!("invalid timestamp {value}: {e}")))
}

/// Identifiers are bounded to [`MAX_IDENT_BYTES`] bytes.
pub fn bounded_ident(value: &str) -> Result<()> {
    if value.len() > MAX_IDENT_BYTES {
        return Err(ForgeError::InvalidInput(format!(
            "identifier exceeds {MAX_IDENT_BYTES} bytes"
        )));
    }
    Ok(())
}
