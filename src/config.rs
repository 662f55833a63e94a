//! Configuration for the sinkhole resolver.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables.

use std::{
    env,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::errors::DnsError;

/// Default TTL for sinkhole answers in seconds.
pub const DEFAULT_BLOCK_TTL: u32 = 60;

/// Maximum size of DNS packets in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Smallest datagram every DNS implementation must accept (RFC 1035).
pub const MIN_PACKET_SIZE: usize = 512;

/// Default upstream timeout.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(2000);

/// Expected number of blocklist entries when sizing the index.
pub const DEFAULT_INDEX_CAPACITY: usize = 600_000;

/// Target false-positive rate of the index (0.1%).
pub const DEFAULT_INDEX_FPR: f64 = 0.001;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listening UDP socket to.
    pub bind_addr: SocketAddr,

    /// Upstream resolver every allowed query is relayed to.
    pub upstream: SocketAddr,

    /// How long a forwarded query may wait for the upstream reply.
    pub upstream_timeout: Duration,

    /// Cap on concurrently outstanding upstream requests.
    pub max_upstream_in_flight: usize,

    /// Maximum size of DNS packets.
    pub max_packet_size: usize,

    /// Address returned for blocked A (and non-AAAA) questions.
    pub sinkhole_v4: Ipv4Addr,

    /// Address returned for blocked AAAA questions.
    pub sinkhole_v6: Ipv6Addr,

    /// TTL of sinkhole answers.
    pub block_ttl: u32,

    /// Local blocklist files in hosts or plain-domain format.
    pub blocklist_files: Vec<PathBuf>,

    /// Expected entry count of the membership index.
    pub index_capacity: usize,

    /// Target false-positive rate of the membership index.
    pub index_fpr: f64,

    /// Where the index snapshot is persisted.
    pub snapshot_path: PathBuf,

    /// Refuse to start when no index can be loaded or built.
    pub fail_closed: bool,

    /// Path to the SQLite audit database.
    pub db_path: String,

    /// Capacity of the audit record queue.
    pub audit_queue: usize,

    /// Optional address for the Prometheus exporter.
    pub metrics_bind: Option<SocketAddr>,
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    ///
    /// # Returns
    /// A `Result` containing either the loaded `ServerConfig` or a `DnsError`.
    pub fn from_env() -> Result<Self, DnsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Unset keys fall back to their defaults; set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DnsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let index_fpr: f64 = parse_or(&lookup, "DNS_INDEX_FPR", DEFAULT_INDEX_FPR)?;
        if !(index_fpr > 0.0 && index_fpr < 1.0) {
            return Err(DnsError::Config(format!(
                "DNS_INDEX_FPR must be between 0 and 1, got {index_fpr}"
            )));
        }

        let upstream_timeout_ms: u64 = parse_or(
            &lookup,
            "DNS_UPSTREAM_TIMEOUT_MS",
            DEFAULT_UPSTREAM_TIMEOUT.as_millis() as u64,
        )?;

        let max_upstream_in_flight: usize = parse_or(&lookup, "DNS_MAX_UPSTREAM_INFLIGHT", 512)?;
        if max_upstream_in_flight == 0 {
            return Err(DnsError::Config("DNS_MAX_UPSTREAM_INFLIGHT must be at least 1".into()));
        }

        let max_packet_size: usize = parse_or(&lookup, "DNS_MAX_PACKET_SIZE", MAX_PACKET_SIZE)?;
        if max_packet_size < MIN_PACKET_SIZE {
            return Err(DnsError::Config(format!(
                "DNS_MAX_PACKET_SIZE must be at least {MIN_PACKET_SIZE}, got {max_packet_size}"
            )));
        }

        let blocklist_files = lookup("DNS_BLOCKLIST_FILES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let metrics_bind = match lookup("DNS_METRICS_BIND") {
            Some(v) if !v.trim().is_empty() => Some(
                v.trim()
                    .parse()
                    .map_err(|_| DnsError::Config("Invalid DNS_METRICS_BIND address".into()))?,
            ),
            _ => None,
        };

        Ok(Self {
            bind_addr: parse_or(&lookup, "DNS_BIND", SocketAddr::from(([0, 0, 0, 0], 53)))?,
            upstream: parse_or(&lookup, "DNS_UPSTREAM", SocketAddr::from(([8, 8, 8, 8], 53)))?,
            upstream_timeout: Duration::from_millis(upstream_timeout_ms),
            max_upstream_in_flight,
            max_packet_size,
            sinkhole_v4: parse_or(&lookup, "DNS_SINKHOLE_IPV4", Ipv4Addr::UNSPECIFIED)?,
            sinkhole_v6: parse_or(&lookup, "DNS_SINKHOLE_IPV6", Ipv6Addr::UNSPECIFIED)?,
            block_ttl: parse_or(&lookup, "DNS_BLOCK_TTL", DEFAULT_BLOCK_TTL)?,
            blocklist_files,
            index_capacity: parse_or(&lookup, "DNS_INDEX_CAPACITY", DEFAULT_INDEX_CAPACITY)?,
            index_fpr,
            snapshot_path: lookup("DNS_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("blocklist.idx")),
            fail_closed: lookup("DNS_FAIL_CLOSED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            db_path: lookup("DNS_DB_PATH").unwrap_or_else(|| "dns_logs.db".into()),
            audit_queue: parse_or(&lookup, "DNS_AUDIT_QUEUE", 10_000)?,
            metrics_bind,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, DnsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DnsError::Config(format!("Invalid {key} value: {raw}"))),
        None => Ok(default),
    }
}
