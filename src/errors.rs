//! Error types for the sinkhole resolver.
//!
//! Every fallible operation in the crate returns `Result<_, DnsError>`.
//! Query-path variants are contained by the handler and never stop the server.

use std::time::Duration;

use thiserror::Error;

/// Represents errors that can occur in the sinkhole resolver.
#[derive(Error, Debug)]
pub enum DnsError {
    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database errors from rusqlite.
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Connection pool errors from r2d2.
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Errors raised by the DNS codec while encoding a reply.
    #[error("DNS codec error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// The incoming datagram could not be decoded as a DNS query.
    #[error("Malformed datagram: {0}")]
    MalformedDatagram(String),

    /// The upstream resolver did not answer in time.
    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// Socket failure while talking to the upstream resolver.
    #[error("Upstream network error: {0}")]
    UpstreamNetwork(std::io::Error),

    /// The membership index could not be built.
    #[error("Index build failed: {0}")]
    IndexBuild(String),

    /// A persisted index snapshot exists but cannot be trusted.
    #[error("Corrupt index snapshot: {0}")]
    SnapshotCorrupt(String),

    /// An audit record could not be queued or stored.
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DnsError {
    /// True for the two ways a forward can fail.
    pub fn is_upstream(&self) -> bool {
        matches!(self, DnsError::UpstreamTimeout(_) | DnsError::UpstreamNetwork(_))
    }
}
