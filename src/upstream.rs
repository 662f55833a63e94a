//! Upstream forwarding.
//!
//! Allowed queries are relayed byte-for-byte to a single upstream resolver
//! and the first datagram it sends back is returned unchanged.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use crate::errors::DnsError;

/// Largest payload a UDP datagram can carry; replies up to this size pass through whole.
const MAX_REPLY_SIZE: usize = u16::MAX as usize;

/// Something that can answer a raw DNS query on our behalf.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Relay `query` and return the raw reply.
    ///
    /// Fails with `UpstreamTimeout` or `UpstreamNetwork`.
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, DnsError>;
}

/// Forwards over UDP using one ephemeral socket per query.
///
/// Concurrent outstanding requests are capped by a semaphore so a burst of
/// queries cannot exhaust local ports or file descriptors.
pub struct UdpForwarder {
    upstream: SocketAddr,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl UdpForwarder {
    /// Create a forwarder.
    ///
    /// # Arguments
    /// * `upstream` - The resolver to relay to.
    /// * `timeout` - Budget for one query, including waiting for a permit.
    /// * `max_in_flight` - Upper bound on simultaneously open upstream sockets.
    pub fn new(upstream: SocketAddr, timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            upstream,
            timeout,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Number of upstream requests that could start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "forwarder closed"))?;

        let local: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_REPLY_SIZE];
        let size = socket.recv(&mut buf).await?;
        buf.truncate(size);
        Ok(buf)
    }
}

#[async_trait]
impl Forwarder for UdpForwarder {
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        match tokio::time::timeout(self.timeout, self.exchange(query)).await {
            Ok(Ok(reply)) => {
                debug!("Received {} byte reply from {}", reply.len(), self.upstream);
                Ok(reply)
            }
            Ok(Err(e)) => Err(DnsError::UpstreamNetwork(e)),
            Err(_) => Err(DnsError::UpstreamTimeout(self.timeout)),
        }
    }
}
