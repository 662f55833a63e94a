//! Request handlers for the DNS server.
//!
//! This module provides the UDP receive loop and the per-datagram handler
//! that decides between the sinkhole answer and the upstream resolver.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::{net::UdpSocket, task::JoinSet};

use crate::audit::{AuditLogger, AuditRecord};
use crate::config::ServerConfig;
use crate::dns::{parse_query, servfail_response, sinkhole_response, ParsedQuery, Sinkhole};
use crate::errors::DnsError;
use crate::index::ActiveIndex;
use crate::upstream::Forwarder;

/// How a query was answered.
#[derive(Debug)]
pub enum Outcome {
    /// Matched the blocklist; answered with the sinkhole address.
    Blocked,
    /// Relayed upstream; the upstream reply was returned unchanged.
    Forwarded,
    /// Matched the blocklist but the sinkhole answer could not be encoded;
    /// answered with SERVFAIL.
    BlockFailed(DnsError),
    /// Relaying failed; answered with SERVFAIL.
    ForwardFailed(DnsError),
}

impl Outcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Outcome::Blocked | Outcome::BlockFailed(_))
    }

    /// Whether the client got a real answer.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Blocked | Outcome::Forwarded)
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Blocked => "blocked",
            Outcome::Forwarded => "forwarded",
            Outcome::BlockFailed(_) | Outcome::ForwardFailed(_) => "servfail",
        }
    }
}

/// Everything a query task needs, shared by all of them.
pub struct QueryHandler {
    index: Arc<ActiveIndex>,
    forwarder: Arc<dyn Forwarder>,
    audit: AuditLogger,
    sinkhole: Sinkhole,
    max_packet_size: usize,
}

impl QueryHandler {
    pub fn new(
        config: &ServerConfig,
        index: Arc<ActiveIndex>,
        forwarder: Arc<dyn Forwarder>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            index,
            forwarder,
            audit,
            sinkhole: Sinkhole {
                v4: config.sinkhole_v4,
                v6: config.sinkhole_v6,
                ttl: config.block_ttl,
            },
            max_packet_size: config.max_packet_size,
        }
    }

    /// Decide how to answer a query and produce the reply bytes.
    ///
    /// # Arguments
    /// * `query` - The decoded query.
    ///
    /// # Returns
    /// The outcome and the datagram to send back. The datagram is empty
    /// only if no reply could be encoded at all.
    pub async fn resolve(&self, query: &ParsedQuery) -> (Outcome, Vec<u8>) {
        let matched = self
            .index
            .load()
            .matching_suffix(query.name.as_str())
            .map(str::to_owned);

        if let Some(suffix) = matched {
            debug!("Blocking {} (listed as {}) for {}", query.name, suffix, query.client);
            return self.answer_blocked(query, sinkhole_response(&query.request, &self.sinkhole));
        }

        match self.forwarder.forward(&query.raw).await {
            Ok(reply) => {
                debug!("Forwarded {} {} for {}", query.query_type, query.name, query.client);
                (Outcome::Forwarded, reply)
            }
            Err(e) => {
                if e.is_upstream() {
                    warn!("Upstream failed for {}: {}", query.name, e);
                } else {
                    error!("Forwarding {} failed: {}", query.name, e);
                }
                let reply = self.servfail(query);
                (Outcome::ForwardFailed(e), reply)
            }
        }
    }

    fn answer_blocked(
        &self,
        query: &ParsedQuery,
        encoded: Result<Vec<u8>, DnsError>,
    ) -> (Outcome, Vec<u8>) {
        match encoded {
            Ok(reply) => (Outcome::Blocked, reply),
            Err(e) => {
                error!("Failed to encode sinkhole answer for {}: {}", query.name, e);
                (Outcome::BlockFailed(e), self.servfail(query))
            }
        }
    }

    fn servfail(&self, query: &ParsedQuery) -> Vec<u8> {
        servfail_response(&query.request).unwrap_or_else(|e| {
            error!("Failed to encode SERVFAIL for {}: {}", query.name, e);
            Vec::new()
        })
    }

    /// Handle one received datagram end to end.
    ///
    /// Malformed datagrams get no reply and no audit record. Every other
    /// query is answered on `socket` and then audited. Errors are logged,
    /// never returned.
    pub async fn handle_datagram(&self, socket: &UdpSocket, raw: Vec<u8>, client: SocketAddr) {
        let query = match parse_query(raw, client) {
            Ok(query) => query,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", client, e);
                metrics::counter!("sinkhole_malformed_total", 1);
                return;
            }
        };

        let (outcome, reply) = self.resolve(&query).await;
        if !reply.is_empty() {
            if let Err(e) = socket.send_to(&reply, client).await {
                warn!("Failed to send reply to {}: {}", client, e);
            }
        }

        let elapsed = query.received_at.elapsed();
        debug!("Answered {} for {} in {:?}", query.name, client, elapsed);
        metrics::counter!("sinkhole_queries_total", 1, "outcome" => outcome.label());
        metrics::histogram!("sinkhole_response_seconds", elapsed.as_secs_f64());

        self.audit.record(AuditRecord::now(
            client.ip(),
            query.name.into_string(),
            outcome.is_blocked(),
            outcome.is_success(),
        ));
    }
}

/// Bind the listening UDP socket.
pub async fn bind_udp(addr: SocketAddr) -> Result<Arc<UdpSocket>, DnsError> {
    let socket = UdpSocket::bind(addr).await?;
    info!("UDP DNS server listening on {}", socket.local_addr()?);
    Ok(Arc::new(socket))
}

/// Run the UDP DNS server.
///
/// # Arguments
/// * `socket` - The bound listening socket.
/// * `handler` - Shared query handler.
/// * `shutdown` - Resolves when the server should stop receiving.
///
/// # Returns
/// Once `shutdown` has resolved and every in-flight query has finished.
pub async fn run_udp_server<F>(
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    shutdown: F,
) -> Result<(), DnsError>
where
    F: Future<Output = ()>,
{
    let mut buf = vec![0u8; handler.max_packet_size];
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = finished {
                    error!("Query task failed: {}", e);
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((amt, src)) => {
                    let raw = buf[..amt].to_vec();
                    let socket = socket.clone();
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        handler.handle_datagram(&socket, raw, src).await;
                    });
                }
                Err(e) => error!("UDP receive error: {}", e),
            },
        }
    }

    info!("Stopped receiving; waiting for {} in-flight queries", tasks.len());
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            error!("Query task failed: {}", e);
        }
    }
    Ok(())
}
