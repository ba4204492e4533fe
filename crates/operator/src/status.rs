//! Status aggregation and the conflict-aware status write.
use tracing::{debug, info};

use crate::api::{CompositeApp, CompositeAppStatus, StatusDesc};
use crate::store::{StatusStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Unchanged,
    Written,
    /// Someone else updated the app since it was read.
    Conflict,
}

/// Summary strings shown by `kubectl get`.
pub fn describe(app: &CompositeApp, status: &CompositeAppStatus) -> StatusDesc {
    let apps = &app.spec.apps;
    let replicas = apps
        .iter()
        .map(|e| format!("{}:{}-{}({})", e.version, e.min_replicas, e.max_replicas, status.available_replicas.get(&e.version).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(" ");
    let images = apps.iter().map(|e| format!("{}:{}", e.version, e.image_tag())).collect::<Vec<_>>().join(" ");
    let weights = app
        .spec
        .gateway
        .as_ref()
        .map(|g| apps.iter().filter_map(|e| g.weights.get(&e.version).map(|w| format!("{}:{w}", e.version))).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    StatusDesc { replicas, images, weights, prefix_path: app.prefix_path() }
}

/// Fill the derived fields once every kind has reported.
pub fn finish(app: &CompositeApp, status: &mut CompositeAppStatus) {
    status.desc = describe(app, status);
    status.observed_generation = app.metadata.generation;
}

/// Write `status` unless it equals what was read with `app`.
pub async fn write<S>(store: &S, app: &CompositeApp, status: CompositeAppStatus) -> Result<StatusWrite, StoreError>
where
    S: StatusStore<CompositeApp> + ?Sized,
{
    if app.status.as_ref() == Some(&status) {
        debug!("status.unchanged");
        return Ok(StatusWrite::Unchanged);
    }
    let mut next = app.clone();
    next.status = Some(status);
    match store.replace_status(&next).await {
        Ok(_) => {
            info!(success = next.status.as_ref().is_some_and(|s| s.success), "status.written");
            Ok(StatusWrite::Written)
        }
        Err(StoreError::Conflict(reason)) => {
            info!(%reason, "status.conflict");
            Ok(StatusWrite::Conflict)
        }
        Err(e) => Err(e),
    }
}
