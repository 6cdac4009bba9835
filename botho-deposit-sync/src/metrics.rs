//! Prometheus metrics for the deposit sync service.
//!
//! ## Metrics Exported
//! - `deposit_sync_credits_total` - Credits applied to the balance ledger (counter)
//! - `deposit_sync_debits_total` - Debits applied to the balance ledger (counter)
//! - `deposit_sync_sync_failures_total` - Entries left unresolved by a retryable failure (counter)
//! - `deposit_sync_consistency_errors_total` - Entries with more than one unpaired credit (counter)
//! - `deposit_sync_blocks_recorded_total` - Blocks that produced a charge record (counter)
//! - `deposit_sync_pending_blocks` - Blocks tracked in the charge ledger (gauge)
//! - `deposit_sync_tip_height` - Best-chain height last seen (gauge)

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::reconciler::ReconcileSummary;
use crate::types::Direction;

/// Counters and gauges for one service instance.
pub struct SyncMetrics {
    registry: Registry,
    pub credits: IntCounter,
    pub debits: IntCounter,
    pub sync_failures: IntCounter,
    pub consistency_errors: IntCounter,
    pub blocks_recorded: IntCounter,
    pub pending_blocks: IntGauge,
    pub tip_height: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("metric can be created");
    registry
        .register(Box::new(c.clone()))
        .expect("collector can be registered");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("metric can be created");
    registry
        .register(Box::new(g.clone()))
        .expect("collector can be registered");
    g
}

impl SyncMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let credits = counter(
            &registry,
            "deposit_sync_credits_total",
            "Credits applied to the balance ledger",
        );
        let debits = counter(
            &registry,
            "deposit_sync_debits_total",
            "Debits applied to the balance ledger",
        );
        let sync_failures = counter(
            &registry,
            "deposit_sync_sync_failures_total",
            "Charge entries left unresolved by a retryable failure",
        );
        let consistency_errors = counter(
            &registry,
            "deposit_sync_consistency_errors_total",
            "Charge entries with more than one unpaired credit token",
        );
        let blocks_recorded = counter(
            &registry,
            "deposit_sync_blocks_recorded_total",
            "Blocks that produced a charge record",
        );
        let pending_blocks = gauge(
            &registry,
            "deposit_sync_pending_blocks",
            "Blocks tracked in the charge ledger",
        );
        let tip_height = gauge(
            &registry,
            "deposit_sync_tip_height",
            "Best-chain height last seen",
        );

        Self {
            registry,
            credits,
            debits,
            sync_failures,
            consistency_errors,
            blocks_recorded,
            pending_blocks,
            tip_height,
        }
    }

    /// Fold one reconciliation outcome into the counters.
    pub fn observe(&self, direction: Direction, summary: &ReconcileSummary) {
        let applied = summary.applied as u64;
        match direction {
            Direction::Credit => self.credits.inc_by(applied),
            Direction::Debit => self.debits.inc_by(applied),
        }
        let consistency = summary.consistency_errors() as u64;
        self.consistency_errors.inc_by(consistency);
        self.sync_failures
            .inc_by(summary.failures.len() as u64 - consistency);
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve `GET /metrics` on `addr` until `shutdown` flips to true.
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<SyncMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => {
                info!("Metrics server stopping");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(handle_metrics_request(&req, &metrics)) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving metrics connection: {:?}", err);
            }
        });
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn handle_metrics_request<B>(req: &Request<B>, metrics: &SyncMetrics) -> Response<Full<Bytes>> {
    if req.method() != hyper::Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let path = req.uri().path();
    if path != "/metrics" && path != "/" {
        return text_response(StatusCode::NOT_FOUND, "Not found. Try /metrics");
    }

    match metrics.encode() {
        Ok(body) => {
            let mut response = text_response(StatusCode::OK, body);
            if let Ok(value) = hyper::header::HeaderValue::from_str(TextEncoder::new().format_type())
            {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
