use std::sync::Arc;

use tracing::{info_span, Span};

use crate::engine::Outcome;
use crate::telemetry::Metrics;

/// One child decision made during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: &'static str,
    pub name: String,
    pub outcome: Outcome,
}

/// State scoped to a single reconcile pass: its span, the metrics handle, and what it changed.
pub struct PassContext {
    key: String,
    span: Span,
    metrics: Arc<Metrics>,
    changes: Vec<Change>,
}

impl PassContext {
    pub fn new(key: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        let key = key.into();
        let span = info_span!("reconcile", app = %key);
        Self { key, span, metrics, changes: Vec::new() }
    }

    pub fn key(&self) -> &str { &self.key }

    pub fn span(&self) -> &Span { &self.span }

    pub fn metrics(&self) -> &Metrics { &self.metrics }

    pub fn record(&mut self, kind: &'static str, name: &str, outcome: Outcome) {
        self.metrics.record_change(kind, outcome.as_str());
        self.changes.push(Change { kind, name: name.to_string(), outcome });
    }

    pub fn changes(&self) -> &[Change] { &self.changes }

    /// Number of child writes issued (creates, updates, deletes).
    pub fn writes(&self) -> usize { self.changes.iter().filter(|c| c.outcome != Outcome::Unchanged).count() }
}
