use async_trait::async_trait;
use kube::{Client, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::api::CompositeApp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Where user-visible events about a `CompositeApp` go. Delivery is best effort.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, app: &CompositeApp, kind: EventKind, reason: &str, note: String);
}

/// Publishes Kubernetes `Event` objects referencing the app.
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.into(), instance: std::env::var("HOSTNAME").ok() };
        Self { recorder: Recorder::new(client, reporter) }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, app: &CompositeApp, kind: EventKind, reason: &str, note: String) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.into(),
            note: Some(note),
            action: "Reconcile".into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &app.object_ref(&())).await {
            warn!(error=%e, reason, "event.publish_failed");
        }
    }
}
