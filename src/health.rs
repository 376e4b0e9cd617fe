//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the operator ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels identifying one reconciled object
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind).encode(encoder.encode_label())?;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for child object mutations
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MutationLabels {
    pub resource: &'static str,
    pub verb: &'static str,
}

impl prometheus_client::encoding::EncodeLabelSet for MutationLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("resource", self.resource).encode(encoder.encode_label())?;
        ("verb", self.verb).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for reconciliation errors
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub kind: &'static str,
    pub error: &'static str,
}

impl prometheus_client::encoding::EncodeLabelSet for ErrorLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind).encode(encoder.encode_label())?;
        ("error", self.error).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ErrorLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Child objects created, updated or deleted
    pub mutations_total: Family<MutationLabels, Counter>,
    /// Externally rotated certificate secrets observed
    pub certificate_rotations_total: Family<ReconcileLabels, Counter>,

    /// Desired instances per cluster
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    /// Ready instances per cluster
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,
    /// Ready PgBouncer replicas per pooler
    pub pooler_instances_ready: Family<ReconcileLabels, Gauge>,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "pgcluster_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "pgcluster_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let mutations_total = Family::<MutationLabels, Counter>::default();
        registry.register(
            "pgcluster_operator_mutations",
            "Child objects created, updated or deleted",
            mutations_total.clone(),
        );

        let certificate_rotations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pgcluster_operator_certificate_rotations",
            "Certificate secret rotations observed",
            certificate_rotations_total.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pgcluster_operator_cluster_instances_desired",
            "Desired number of instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pgcluster_operator_cluster_instances_ready",
            "Number of ready instances for each cluster",
            cluster_instances_ready.clone(),
        );

        let pooler_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pgcluster_operator_pooler_instances_ready",
            "Number of ready PgBouncer replicas for each pooler",
            pooler_instances_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            mutations_total,
            certificate_rotations_total,
            cluster_instances_desired,
            cluster_instances_ready,
            pooler_instances_ready,
            registry,
        }
    }

    fn labels(kind: &'static str, namespace: &str, name: &str) -> ReconcileLabels {
        ReconcileLabels {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, kind: &'static str, namespace: &str, name: &str, duration_secs: f64) {
        let labels = Self::labels(kind, namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, kind: &'static str, error: &'static str) {
        self.reconciliation_errors_total
            .get_or_create(&ErrorLabels { kind, error })
            .inc();
    }

    /// Record an applied child mutation
    pub fn record_mutation(&self, resource: &'static str, verb: &'static str) {
        self.mutations_total
            .get_or_create(&MutationLabels { resource, verb })
            .inc();
    }

    /// Record rotated certificate secrets of a cluster
    pub fn record_rotations(&self, namespace: &str, name: &str, count: u64) {
        self.certificate_rotations_total
            .get_or_create(&Self::labels("PostgresCluster", namespace, name))
            .inc_by(count);
    }

    /// Update cluster instance metrics
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = Self::labels("PostgresCluster", namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready.get_or_create(&labels).set(ready);
    }

    /// Update pooler replica metrics
    pub fn set_pooler_instances(&self, namespace: &str, name: &str, ready: i64) {
        self.pooler_instances_ready
            .get_or_create(&Self::labels("PostgresPooler", namespace, name))
            .set(ready);
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (leading and controllers running)
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (seconds since the epoch)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember the time of the latest successful reconciliation
    pub fn touch_reconcile(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the controllers are running.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
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
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:{port}`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
