use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "advanced_metrics";

/// Prometheus metrics describing the pipeline itself.
///
/// All metrics use the "advanced_metrics" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Connections accepted on the ingestion socket.
    pub connections_accepted: Counter,
    /// Connections torn down by a read or framing error.
    pub connection_errors: Counter,
    /// Frames handed from connection workers to the ingester.
    pub frames_received: Counter,
    /// Messages stored in the staging table.
    pub messages_ingested: Counter,
    /// Messages dropped because they did not parse against the schema.
    pub messages_dropped: Counter,

    // === Aggregation ===
    /// Aggregation passes over the staging table.
    pub aggregations: Counter,
    /// Samples whose dimensions were collapsed into AGGR buckets.
    pub samples_collapsed: Counter,
    /// Samples in the most recent staging snapshot.
    pub staging_snapshot_samples: Gauge,
    /// Samples held by the priority table after the last aggregation.
    pub priority_table_samples: Gauge,

    // === Publishing ===
    /// Batches delivered to the output queue.
    pub publishes: Counter,
    /// Batches dropped on timeout or cancellation.
    pub publish_errors: Counter,
    /// Metric sets in the most recent published batch.
    pub metric_sets_published: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter> {
            let c = Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let g = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let connections_accepted = counter(
            "connections_accepted_total",
            "Connections accepted on the ingestion socket.",
        )?;
        let connection_errors = counter(
            "connection_errors_total",
            "Connections torn down by a read or framing error.",
        )?;
        let frames_received = counter(
            "frames_received_total",
            "Frames handed from connection workers to the ingester.",
        )?;
        let messages_ingested = counter(
            "messages_ingested_total",
            "Messages stored in the staging table.",
        )?;
        let messages_dropped = counter(
            "messages_dropped_total",
            "Messages dropped because they did not parse against the schema.",
        )?;
        let aggregations = counter(
            "aggregations_total",
            "Aggregation passes over the staging table.",
        )?;
        let samples_collapsed = counter(
            "samples_collapsed_total",
            "Samples whose dimensions were collapsed into AGGR buckets.",
        )?;
        let staging_snapshot_samples = gauge(
            "staging_snapshot_samples",
            "Samples in the most recent staging snapshot.",
        )?;
        let priority_table_samples = gauge(
            "priority_table_samples",
            "Samples held by the priority table after the last aggregation.",
        )?;
        let publishes = counter(
            "publishes_total",
            "Batches delivered to the output queue.",
        )?;
        let publish_errors = counter(
            "publish_errors_total",
            "Batches dropped on timeout or cancellation.",
        )?;
        let metric_sets_published = gauge(
            "metric_sets_published",
            "Metric sets in the most recent published batch.",
        )?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            connections_accepted,
            connection_errors,
            frames_received,
            messages_ingested,
            messages_dropped,
            aggregations,
            samples_collapsed,
            staging_snapshot_samples,
            priority_table_samples,
            publishes,
            publish_errors,
            metric_sets_published,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
