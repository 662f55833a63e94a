//! DNS Sinkhole
//!
//! A filtering DNS resolver that answers blocklisted names with a sinkhole
//! address and forwards everything else to an upstream resolver.

use std::sync::Arc;

use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{signal, task};

use dns_sinkhole::{
    audit::{AuditLogger, AuditSink, LogSink},
    config::ServerConfig,
    db::init_db,
    errors::DnsError,
    handlers::{bind_udp, run_udp_server, QueryHandler},
    index::{load_or_build, ActiveIndex},
    upstream::UdpForwarder,
};

#[tokio::main]
async fn main() -> Result<(), DnsError> {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    // Load configuration from environment variables
    let config = ServerConfig::from_env()?;

    if let Some(addr) = config.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| DnsError::Config(format!("Failed to start metrics exporter: {e}")))?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    // The index must be complete before the first query is served
    let index = {
        let config = config.clone();
        task::spawn_blocking(move || load_or_build(&config))
            .await
            .map_err(|e| DnsError::IndexBuild(e.to_string()))??
    };
    info!(
        "Blocklist index ready: ~{} entries, {} KiB, estimated FPR {:.5}",
        index.len(),
        index.memory_bytes() / 1024,
        index.estimated_false_positive_rate()
    );
    let index = Arc::new(ActiveIndex::new(index));

    // Initialize the audit store
    let sink: Arc<dyn AuditSink> = match init_db(&config.db_path) {
        Ok(store) => {
            info!("Audit log at {}", config.db_path);
            Arc::new(store)
        }
        Err(e) => {
            warn!("Cannot open audit database {}: {}; logging to stderr", config.db_path, e);
            Arc::new(LogSink)
        }
    };
    let (audit, writer) = AuditLogger::spawn(sink, config.audit_queue);

    let forwarder = Arc::new(UdpForwarder::new(
        config.upstream,
        config.upstream_timeout,
        config.max_upstream_in_flight,
    ));
    info!("Forwarding allowed queries to {}", config.upstream);

    let handler = Arc::new(QueryHandler::new(&config, index.clone(), forwarder, audit));
    let socket = bind_udp(config.bind_addr).await?;

    #[cfg(unix)]
    let reload = reload_on_hangup(config.clone(), index)?;

    run_udp_server(socket, handler, shutdown_signal()).await?;

    #[cfg(unix)]
    reload.abort();

    info!("Flushing audit log...");
    writer.finish().await;
    info!("Shutdown complete");
    Ok(())
}

/// Rebuild the index from its sources whenever SIGHUP arrives.
///
/// A failed rebuild keeps the current index.
#[cfg(unix)]
fn reload_on_hangup(
    config: ServerConfig,
    index: Arc<ActiveIndex>,
) -> Result<task::JoinHandle<()>, DnsError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(task::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, rebuilding blocklist index");
            let config = config.clone();
            match task::spawn_blocking(move || dns_sinkhole::index::rebuild(&config)).await {
                Ok(Ok(rebuilt)) => {
                    let entries = rebuilt.len();
                    index.replace(rebuilt);
                    info!("Blocklist index reloaded (~{} entries)", entries);
                }
                Ok(Err(e)) => error!("Reload failed, keeping current index: {}", e),
                Err(e) => error!("Reload task failed: {}", e),
            }
        }
    }))
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining in-flight queries");
}
