//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Content retrieval seam.
//!
//! Plans fetch manifests and file payloads through the [`Transport`]
//! trait, so evaluation and execution never care where bytes come
//! from. The in-memory implementation backs the tests; a depot
//! client would implement the same trait.

use crate::fmri::Fmri;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("manifest not found for {0}")]
    #[diagnostic(code(pkg::transport_error::manifest_not_found))]
    ManifestNotFound(String),

    #[error("content not found for digest {0}")]
    #[diagnostic(code(pkg::transport_error::content_not_found))]
    ContentNotFound(String),

    #[error("unknown publisher: {0}")]
    #[diagnostic(code(pkg::transport_error::unknown_publisher))]
    UnknownPublisher(String),

    #[error("connection to {origin} failed: {reason}")]
    #[diagnostic(
        code(pkg::transport_error::connection_failed),
        help("The origin may be temporarily unreachable; the operation can be retried")
    )]
    ConnectionFailed { origin: String, reason: String },

    #[error("request to {origin} timed out")]
    #[diagnostic(code(pkg::transport_error::timeout))]
    Timeout { origin: String },

    #[error("{origin} answered HTTP {status}")]
    #[diagnostic(code(pkg::transport_error::http_status))]
    HttpStatus { origin: String, status: u16 },

    #[error("content for digest {digest} failed verification")]
    #[diagnostic(
        code(pkg::transport_error::digest_mismatch),
        help("The origin delivered corrupt content; retrying may fetch a good copy")
    )]
    DigestMismatch { digest: String, actual: String },

    #[error("I/O error: {0}")]
    #[diagnostic(code(pkg::transport_error::io))]
    IO(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying the same request can reasonably succeed.
    /// Missing resources and client errors are permanent; network
    /// trouble and server-side failures are not.
    pub fn retryable(&self) -> bool {
        match self {
            TransportError::ConnectionFailed { .. } | TransportError::Timeout { .. } => true,
            TransportError::DigestMismatch { .. } => true,
            TransportError::HttpStatus { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            TransportError::ManifestNotFound(_)
            | TransportError::ContentNotFound(_)
            | TransportError::UnknownPublisher(_)
            | TransportError::IO(_) => false,
        }
    }
}

/// The final failure set after retries are exhausted, one entry per
/// failed request.
#[derive(Debug, Error, Diagnostic)]
#[error("{} transfer(s) failed; first: {}", .errors.len(), .errors.first().map(|e| e.to_string()).unwrap_or_default())]
#[diagnostic(code(pkg::transport_error::multi))]
pub struct MultiTransportError {
    pub errors: Vec<TransportError>,
}

/// Collapses repeated failures of the same request into one counted
/// record instead of one log line per attempt.
#[derive(Debug, Default)]
pub struct RetryLog {
    attempts: HashMap<String, u32>,
}

impl RetryLog {
    pub fn new() -> RetryLog {
        RetryLog::default()
    }

    /// Record a failed attempt; logs on the first failure only and
    /// returns the attempt count so far.
    pub fn record(&mut self, request: &str, err: &TransportError) -> u32 {
        let count = self.attempts.entry(request.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            warn!(request, error = %err, retryable = err.retryable(), "transfer failed");
        }
        *count
    }

    pub fn attempts(&self, request: &str) -> u32 {
        self.attempts.get(request).copied().unwrap_or(0)
    }
}

/// Where manifests and payloads come from.
pub trait Transport {
    /// Fetch the manifest text of a package.
    fn get_manifest(&mut self, fmri: &Fmri) -> Result<String>;

    /// Fetch a file payload by content digest.
    fn get_content(&mut self, digest: &str) -> Result<Vec<u8>>;

    /// When the publisher's catalog last changed, for incremental
    /// refresh decisions.
    fn get_publisher_last_update_time(&mut self, prefix: &str) -> Result<DateTime<Utc>>;
}

/// An in-memory origin. Tests preload it; the catalog refresh path
/// uses it as a stand-in for a depot connection.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    manifests: HashMap<String, String>,
    content: HashMap<String, Vec<u8>>,
    publisher_updates: HashMap<String, DateTime<Utc>>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    pub fn add_manifest(&mut self, fmri: &Fmri, content: &str) {
        self.manifests
            .insert(fmri.to_string(), content.to_string());
    }

    pub fn add_content(&mut self, digest: &str, bytes: Vec<u8>) {
        self.content.insert(digest.to_string(), bytes);
    }

    pub fn set_publisher_last_update(&mut self, prefix: &str, ts: DateTime<Utc>) {
        self.publisher_updates.insert(prefix.to_string(), ts);
    }
}

impl Transport for MemoryTransport {
    fn get_manifest(&mut self, fmri: &Fmri) -> Result<String> {
        self.manifests
            .get(&fmri.to_string())
            .cloned()
            .ok_or_else(|| TransportError::ManifestNotFound(fmri.to_string()))
    }

    fn get_content(&mut self, digest: &str) -> Result<Vec<u8>> {
        self.content
            .get(digest)
            .cloned()
            .ok_or_else(|| TransportError::ContentNotFound(digest.to_string()))
    }

    fn get_publisher_last_update_time(&mut self, prefix: &str) -> Result<DateTime<Utc>> {
        self.publisher_updates
            .get(prefix)
            .copied()
            .ok_or_else(|| TransportError::UnknownPublisher(prefix.to_string()))
    }
}
