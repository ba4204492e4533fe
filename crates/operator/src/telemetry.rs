use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{histogram_opts, opts, Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use serde::Serialize;

/// Operator metrics, owned by one registry so tests can build isolated instances.
pub struct Metrics {
    registry: Registry,
    passes: IntCounterVec,
    child_changes: IntCounterVec,
    pass_duration: Histogram,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let passes = IntCounterVec::new(opts!("composite_reconcile_passes_total", "Reconcile passes by outcome"), &["outcome"])?;
        let child_changes =
            IntCounterVec::new(opts!("composite_child_changes_total", "Child object writes by kind and outcome"), &["kind", "outcome"])?;
        let pass_duration = Histogram::with_opts(histogram_opts!("composite_reconcile_duration_seconds", "Wall time of one reconcile pass"))?;
        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(child_changes.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        Ok(Self { registry, passes, child_changes, pass_duration })
    }

    pub fn record_pass(&self, outcome: &str, elapsed: Duration) {
        self.passes.with_label_values(&[outcome]).inc();
        self.pass_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_change(&self, kind: &str, outcome: &str) { self.child_changes.with_label_values(&[kind, outcome]).inc(); }

    pub fn passes(&self, outcome: &str) -> u64 { self.passes.with_label_values(&[outcome]).get() }

    pub fn changes(&self, kind: &str, outcome: &str) -> u64 { self.child_changes.with_label_values(&[kind, outcome]).get() }

    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

#[derive(Clone)]
pub struct ProbeState {
    pub metrics: Arc<Metrics>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
pub struct ProbeResponse {
    pub status: &'static str,
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn health() -> Json<ProbeResponse> { Json(ProbeResponse { status: "ok" }) }

/// Ready once the controller has confirmed the CRD is served and started watching.
pub async fn readiness(State(state): State<ProbeState>) -> (StatusCode, Json<ProbeResponse>) {
    if state.ready.load(Ordering::Relaxed) { (StatusCode::OK, Json(ProbeResponse { status: "ready" })) }
    else { (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "starting" })) }
}

pub async fn metrics_handler(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(buf) => ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response(),
        Err(e) => {
            tracing::warn!(error=%e, "metrics.encode_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
