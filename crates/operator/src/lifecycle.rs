//! Finalizer gate: nothing is reconciled while the app is being deleted.
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::info;

use crate::api::CompositeApp;
use crate::error::{Error, Result};
use crate::store::{Store, StoreError};

pub const FINALIZER: &str = "apps.composite.dev/finalizer";

/// Where an app stands with respect to our finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live, finalizer not yet added.
    Unregistered,
    /// Live, finalizer present.
    Registered,
    /// Deletion requested, finalizer still present.
    Finalizing,
    /// Deletion requested and our finalizer already removed.
    Released,
}

impl FinalizerState {
    pub fn of(app: &CompositeApp) -> Self {
        let tagged = app.finalizers().iter().any(|f| f == FINALIZER);
        match (tagged, app.meta().deletion_timestamp.is_some()) {
            (false, false) => Self::Unregistered,
            (true, false) => Self::Registered,
            (true, true) => Self::Finalizing,
            (false, true) => Self::Released,
        }
    }
}

/// Runs before the finalizer is released. An error keeps the app terminating.
#[async_trait]
pub trait PreDeleteHook: Send + Sync {
    async fn pre_delete(&self, app: &CompositeApp) -> anyhow::Result<()>;
}

/// Children are removed by owner-reference garbage collection, so nothing runs by default.
pub struct NoopHook;

#[async_trait]
impl PreDeleteHook for NoopHook {
    async fn pre_delete(&self, _app: &CompositeApp) -> anyhow::Result<()> { Ok(()) }
}

#[derive(Debug)]
pub enum Gate {
    /// Reconcile this (possibly just persisted) object.
    Proceed(CompositeApp),
    /// The hook ran and the finalizer was released.
    Finalized,
    /// Deletion already released; nothing to do.
    Released,
    /// The finalizer write lost a resourceVersion race; requeue and read again.
    Retry,
}

pub async fn gate<S>(store: &S, hook: &dyn PreDeleteHook, app: &CompositeApp) -> Result<Gate>
where
    S: Store<CompositeApp> + ?Sized,
{
    match FinalizerState::of(app) {
        FinalizerState::Unregistered => {
            let mut next = app.clone();
            next.finalizers_mut().push(FINALIZER.into());
            let Some(persisted) = persist(store, &next).await? else { return Ok(Gate::Retry) };
            info!(finalizer = FINALIZER, "finalizer.registered");
            Ok(Gate::Proceed(persisted))
        }
        FinalizerState::Registered => Ok(Gate::Proceed(app.clone())),
        FinalizerState::Finalizing => {
            hook.pre_delete(app).await.map_err(Error::Hook)?;
            let mut next = app.clone();
            next.finalizers_mut().retain(|f| f != FINALIZER);
            if persist(store, &next).await?.is_none() { return Ok(Gate::Retry); }
            info!(finalizer = FINALIZER, "finalizer.released");
            Ok(Gate::Finalized)
        }
        FinalizerState::Released => Ok(Gate::Released),
    }
}

/// Replace `app`; `None` when another writer got there first.
async fn persist<S>(store: &S, app: &CompositeApp) -> Result<Option<CompositeApp>>
where
    S: Store<CompositeApp> + ?Sized,
{
    match store.replace(app).await {
        Ok(persisted) => Ok(Some(persisted)),
        Err(StoreError::Conflict(reason)) => {
            info!(%reason, "finalizer.conflict");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}
