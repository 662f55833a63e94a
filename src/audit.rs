//! Audit trail of handled queries.
//!
//! Handlers hand records to an `AuditLogger`, which only enqueues them. A
//! single writer on a blocking thread drains the queue into the
//! `AuditSink`, so a slow store can never delay a DNS reply, and the store
//! sees one writer regardless of how many queries are in flight.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::errors::DnsError;

/// Largest number of records written in one batch.
const MAX_BATCH: usize = 256;

/// Outcome of one decoded query.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub client_ip: IpAddr,
    pub domain: String,
    pub blocked: bool,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Record stamped with the current time.
    pub fn now(client_ip: IpAddr, domain: impl Into<String>, blocked: bool, success: bool) -> Self {
        Self {
            client_ip,
            domain: domain.into(),
            blocked,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Record selection for `AuditSink::query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub client_ip: Option<IpAddr>,
    /// Substring of the domain.
    pub domain: Option<String>,
    pub blocked: Option<bool>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

/// Page of results, newest first.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Append-only store for audit records.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), DnsError>;

    /// Store several records; stores with transactions should override this.
    fn append_batch(&self, records: &[AuditRecord]) -> Result<(), DnsError> {
        records.iter().try_for_each(|record| self.append(record))
    }

    fn query(&self, filter: &AuditFilter, page: Pagination) -> Result<Vec<AuditRecord>, DnsError>;
}

/// Sink that writes records to the process log. Used when no database is available.
pub struct LogSink;

impl AuditSink for LogSink {
    fn append(&self, record: &AuditRecord) -> Result<(), DnsError> {
        info!(
            target: "audit",
            "{} {} blocked={} success={} at {}",
            record.client_ip,
            record.domain,
            record.blocked as u8,
            record.success as u8,
            record.timestamp.to_rfc3339()
        );
        Ok(())
    }

    fn query(&self, _filter: &AuditFilter, _page: Pagination) -> Result<Vec<AuditRecord>, DnsError> {
        Ok(Vec::new())
    }
}

/// Cheap, cloneable handle used by query handlers to emit records.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditRecord>,
}

/// The writer task behind an `AuditLogger`.
pub struct AuditWriter {
    handle: JoinHandle<()>,
}

impl AuditLogger {
    /// Start the writer and return the handle that feeds it.
    ///
    /// The writer runs until every `AuditLogger` clone has been dropped,
    /// then flushes what is left and exits.
    pub fn spawn(sink: Arc<dyn AuditSink>, queue: usize) -> (Self, AuditWriter) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let handle = tokio::task::spawn_blocking(move || write_loop(sink, rx));
        (Self { tx }, AuditWriter { handle })
    }

    /// Queue a record without waiting. A full or closed queue drops the record.
    pub fn record(&self, record: AuditRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!("Audit queue full, dropping record for {}", record.domain);
                metrics::counter!("sinkhole_audit_dropped_total", 1);
            }
            Err(TrySendError::Closed(record)) => {
                warn!("Audit writer stopped, dropping record for {}", record.domain);
                metrics::counter!("sinkhole_audit_dropped_total", 1);
            }
        }
    }
}

impl AuditWriter {
    /// Wait until every queued record has been handed to the sink.
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            error!("Audit writer panicked: {}", e);
        }
    }
}

fn write_loop(sink: Arc<dyn AuditSink>, mut rx: mpsc::Receiver<AuditRecord>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while let Some(first) = rx.blocking_recv() {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        if let Err(e) = sink.append_batch(&batch) {
            let e = DnsError::AuditWrite(format!("{} records lost: {}", batch.len(), e));
            error!("{}", e);
            metrics::counter!("sinkhole_audit_failed_total", batch.len() as u64);
        }
        batch.clear();
    }
}
