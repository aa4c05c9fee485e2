//! Per-request diagnostic record.
//!
//! One record is produced for every request the protocol handler completes.
//! The JSON field names are consumed by hosts and must stay stable.

use std::fmt;

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::request::Parts;
use http::{HeaderMap, Version};
use serde::{Deserialize, Serialize};

/// Header carrying the final size of a chunked upload (macOS Finder sends it).
pub const EXPECTED_ENTITY_LENGTH: &str = "x-expected-entity-length";

/// Summary of a completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDiagnostic {
    /// Request method, e.g. `PROPFIND`.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Declared body length; `-1` for chunked bodies of unknown length.
    pub content_length: i64,
    /// Whether the connection is marked for closure after this request.
    pub close: bool,
    /// Parsed `X-Expected-Entity-Length`, `0` when absent or invalid.
    pub x_expected_entity_length: i64,
    /// Handler error text, empty on success.
    pub error: String,
}

impl RequestDiagnostic {
    /// Build a record from request head fields with no error attached.
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            content_length: content_length(&parts.headers),
            close: wants_close(parts.version, &parts.headers),
            x_expected_entity_length: header_i64(&parts.headers, EXPECTED_ENTITY_LENGTH)
                .unwrap_or(0),
            error: String::new(),
        }
    }

    /// Attach the handler's error text.
    #[must_use]
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = error.to_string();
        self
    }

    /// Compact JSON form handed to the host.
    pub fn to_json(&self) -> String {
        // Plain strings/ints/bools only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
}

fn content_length(headers: &HeaderMap) -> i64 {
    if let Some(length) = header_i64(headers, CONTENT_LENGTH.as_str()) {
        return length;
    }
    if headers.contains_key(TRANSFER_ENCODING) {
        -1
    } else {
        0
    }
}

fn has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::HTTP_09 => true,
        Version::HTTP_10 => !has_token(headers, "keep-alive"),
        Version::HTTP_11 => has_token(headers, "close"),
        _ => false,
    }
}
