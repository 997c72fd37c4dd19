//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for per-module metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ModuleLabels {
    pub module: String,
}

impl EncodeLabelSet for ModuleLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("module", self.module.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for watch event metrics (module + event type)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub module: String,
    pub event_type: String,
}

impl EncodeLabelSet for EventLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("module", self.module.as_str()).encode(encoder.encode_label())?;
        ("type", self.event_type.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for admission metrics (webhook + outcome)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AdmissionLabels {
    pub webhook: String,
    pub outcome: String,
}

impl EncodeLabelSet for AdmissionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("webhook", self.webhook.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for replication status transitions
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StatusLabels {
    pub status: String,
}

impl EncodeLabelSet for StatusLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the controller and webhooks
pub struct Metrics {
    /// Watch events dequeued by workers
    pub events_total: Family<EventLabels, Counter>,
    /// Events whose reconciler failed or panicked
    pub event_errors_total: Family<ModuleLabels, Counter>,
    /// Reconciler duration histogram
    pub reconcile_duration_seconds: Family<ModuleLabels, Histogram>,
    /// Admission requests by webhook and outcome
    pub admission_requests_total: Family<AdmissionLabels, Counter>,
    /// ImageReplication status transitions
    pub replications_total: Family<StatusLabels, Counter>,
    /// Events waiting in each module's queue
    pub queue_depth: Family<ModuleLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "orbit_events",
            "Total number of watch events processed",
            events_total.clone(),
        );

        let event_errors_total = Family::<ModuleLabels, Counter>::default();
        registry.register(
            "orbit_event_errors",
            "Total number of watch events whose reconciler failed",
            event_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ModuleLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "orbit_reconcile_duration_seconds",
            "Duration of event reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let admission_requests_total = Family::<AdmissionLabels, Counter>::default();
        registry.register(
            "orbit_admission_requests",
            "Total number of admission requests",
            admission_requests_total.clone(),
        );

        let replications_total = Family::<StatusLabels, Counter>::default();
        registry.register(
            "orbit_replications",
            "Total number of ImageReplication status transitions",
            replications_total.clone(),
        );

        let queue_depth = Family::<ModuleLabels, Gauge>::default();
        registry.register(
            "orbit_queue_depth",
            "Number of events waiting in a module's queue",
            queue_depth.clone(),
        );

        Self {
            events_total,
            event_errors_total,
            reconcile_duration_seconds,
            admission_requests_total,
            replications_total,
            queue_depth,
            registry,
        }
    }

    /// Record a processed watch event
    pub fn record_event(&self, module: &str, event_type: &str, duration_secs: f64) {
        let labels = EventLabels {
            module: module.to_string(),
            event_type: event_type.to_string(),
        };
        self.events_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&ModuleLabels {
                module: module.to_string(),
            })
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, module: &str) {
        let labels = ModuleLabels {
            module: module.to_string(),
        };
        self.event_errors_total.get_or_create(&labels).inc();
    }

    /// Record an admission decision
    pub fn record_admission(&self, webhook: &str, outcome: &str) {
        let labels = AdmissionLabels {
            webhook: webhook.to_string(),
            outcome: outcome.to_string(),
        };
        self.admission_requests_total.get_or_create(&labels).inc();
    }

    /// Record an ImageReplication entering `status`
    pub fn record_replication(&self, status: &str) {
        let labels = StatusLabels {
            status: status.to_string(),
        };
        self.replications_total.get_or_create(&labels).inc();
    }

    /// Update the queue depth for a module
    pub fn set_queue_depth(&self, module: &str, depth: i64) {
        let labels = ModuleLabels {
            module: module.to_string(),
        };
        self.queue_depth.get_or_create(&labels).set(depth);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the process is ready (leadership acquired, or webhook serving)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last processed event timestamp (Unix epoch seconds)
    pub last_event: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_event: AtomicU64::new(0),
        }
    }

    /// Mark the process as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the process is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Record that an event was just processed
    pub fn touch(&self) {
        let now = jiff::Timestamp::now().as_second().max(0) as u64;
        self.last_event.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK once the watch module or webhook is serving.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Default health server port
pub const HEALTH_PORT: u16 = 8080;

/// Run the health server
///
/// Binds to 0.0.0.0:`port` and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
