//! One reconcile pass over a `CompositeApp`.
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tracing::{error, info, warn, Instrument};

use crate::api::{CompositeApp, CompositeAppStatus, ValidationError};
use crate::children::{self, OwnedResource};
use crate::context::PassContext;
use crate::engine::Outcome;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSink};
use crate::lifecycle::{self, Gate, PreDeleteHook};
use crate::status::{self, StatusWrite};
use crate::store::Cluster;
use crate::telemetry::Metrics;

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every kind was applied; `success` is false when any child failed.
    Converged { success: bool, writes: usize },
    /// A finalizer, child or status write lost a race; requeue and read again.
    Retry,
    /// `spec` failed validation; no child was touched.
    Rejected(ValidationError),
    /// The pre-delete hook ran and the finalizer was released.
    Finalized,
    /// Already released; nothing to do.
    Released,
}

impl PassOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged { success: true, .. } => "converged",
            Self::Converged { success: false, .. } => "degraded",
            Self::Retry => "retry",
            Self::Rejected(_) => "rejected",
            Self::Finalized => "finalized",
            Self::Released => "released",
        }
    }
}

pub struct Reconciler<C: ?Sized> {
    cluster: Arc<C>,
    hook: Arc<dyn PreDeleteHook>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    resources: Vec<Box<dyn OwnedResource<C>>>,
}

impl<C: Cluster + ?Sized> Reconciler<C> {
    pub fn new(cluster: Arc<C>, hook: Arc<dyn PreDeleteHook>, events: Arc<dyn EventSink>, metrics: Arc<Metrics>) -> Self {
        Self { cluster, hook, events, metrics, resources: children::owned_resources() }
    }

    pub fn metrics(&self) -> &Arc<Metrics> { &self.metrics }

    /// Run one pass. Panics inside the pass are caught and reported as [`Error::Panic`].
    pub async fn reconcile(&self, app: &CompositeApp) -> Result<PassOutcome> {
        let mut ctx = PassContext::new(app.key(), self.metrics.clone());
        let span = ctx.span().clone();
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.pass(&mut ctx, app)).catch_unwind().instrument(span.clone()).await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                span.in_scope(|| error!(panic = %message, "reconcile.panicked"));
                Err(Error::Panic(message))
            }
        };
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(Error::Panic(_)) => "panic",
            Err(_) => "error",
        };
        self.metrics.record_pass(label, started.elapsed());
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        span.in_scope(|| info!(outcome = label, writes = ctx.writes(), elapsed_ms, "reconcile.finished"));
        result
    }

    async fn pass(&self, ctx: &mut PassContext, app: &CompositeApp) -> Result<PassOutcome> {
        let app = match lifecycle::gate(&*self.cluster, &*self.hook, app).await? {
            Gate::Proceed(app) => app,
            Gate::Finalized => return Ok(PassOutcome::Finalized),
            Gate::Released => return Ok(PassOutcome::Released),
            Gate::Retry => return Ok(PassOutcome::Retry),
        };

        if let Err(invalid) = app.validate() {
            warn!(error = %invalid, "spec.invalid");
            self.events.publish(&app, EventKind::Warning, "ValidationError", invalid.to_string()).await;
            let mut status = app.status.clone().unwrap_or_default();
            status.success = false;
            status.message = Some(invalid.to_string());
            status.observed_generation = app.metadata.generation;
            return Ok(match status::write(&*self.cluster, &app, status).await? {
                StatusWrite::Conflict => PassOutcome::Retry,
                _ => PassOutcome::Rejected(invalid),
            });
        }

        let mut status = CompositeAppStatus::default();
        let mut failures = Vec::new();
        let mut raced = false;
        for resource in &self.resources {
            match resource.apply(&*self.cluster, ctx, &app).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    info!(kind = resource.kind(), error = %e, "child.retry");
                    raced = true;
                }
                Err(e) => {
                    self.events.publish(&app, EventKind::Warning, "ApplyError", e.to_string()).await;
                    failures.push(e.to_string());
                }
            }
            if let Err(e) = resource.update_status(&*self.cluster, &app, &mut status).await {
                warn!(kind = resource.kind(), error = %e, "status.observe_failed");
                self.events.publish(&app, EventKind::Warning, "UpdateStatusError", e.to_string()).await;
                failures.push(e.to_string());
            }
        }
        status.success = failures.is_empty();
        status.message = (!failures.is_empty()).then(|| failures.join("; "));
        status::finish(&app, &mut status);

        let success = status.success;
        if success && !raced && ctx.writes() > 0 {
            let summary = ctx
                .changes()
                .iter()
                .filter(|c| c.outcome != Outcome::Unchanged)
                .map(|c| format!("{} {} {}", c.kind, c.name, c.outcome.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            self.events.publish(&app, EventKind::Normal, "Reconciled", summary).await;
        }
        Ok(match status::write(&*self.cluster, &app, status).await? {
            StatusWrite::Conflict => PassOutcome::Retry,
            _ if raced => PassOutcome::Retry,
            StatusWrite::Written | StatusWrite::Unchanged => PassOutcome::Converged { success, writes: ctx.writes() },
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
