//! Child kinds generated from a `CompositeApp`, applied in a fixed order.
pub mod autoscaler;
pub mod destination;
pub mod endpoint;
pub mod router;
pub mod workload;

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use tracing::warn;

use crate::api::{CompositeApp, CompositeAppStatus, VersionEntry};
use crate::context::PassContext;
use crate::engine;
use crate::error::ApplyError;
use crate::store::{Cluster, Store};

pub use autoscaler::Autoscaler;
pub use destination::DestinationPolicy;
pub use endpoint::NetworkEndpoint;
pub use router::TrafficRouter;
pub use workload::Workload;

/// What the parent wants for one child object.
#[derive(Debug, Clone)]
pub enum Desired<K> {
    Present(K),
    /// The object must not exist.
    Absent,
    /// Something outside the operator owns it; never create or delete.
    Unmanaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One object per app, named after the app.
    App,
    /// One object per version entry, named `<app>-<version>`.
    Version,
}

/// One child object a pass must converge.
#[derive(Debug, Clone)]
pub struct Target<'a> {
    pub name: String,
    pub entry: Option<&'a VersionEntry>,
}

pub fn targets(app: &CompositeApp, scope: Scope) -> Vec<Target<'_>> {
    match scope {
        Scope::App => vec![Target { name: kube::ResourceExt::name_any(app), entry: None }],
        Scope::Version => app.spec.apps.iter().map(|e| Target { name: app.version_name(e), entry: Some(e) }).collect(),
    }
}

/// A kind of child object: how to generate it and which of its fields we own.
pub trait ChildKind: Send + Sync + 'static {
    type Object: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Send + Sync + 'static;
    /// The owned fields; two objects with equal projections need no write.
    type Projection: PartialEq + Debug + Send;

    const KIND: &'static str;
    const SCOPE: Scope;
    /// Whether `observe` reads anything, so status lookups can be skipped otherwise.
    const OBSERVES: bool = false;

    fn generate(app: &CompositeApp, entry: Option<&VersionEntry>, observed: Option<&Self::Object>) -> Desired<Self::Object>;

    fn project(obj: &Self::Object) -> Self::Projection;

    /// Carry server-owned fields of the observed object onto an update.
    fn prepare_update(desired: &mut Self::Object, observed: &Self::Object) {
        desired.meta_mut().resource_version = observed.meta().resource_version.clone();
    }

    fn observe(_entry: Option<&VersionEntry>, _observed: Option<&Self::Object>, _status: &mut CompositeAppStatus) {}
}

/// Object-safe face of a child kind, so kinds can be held as an ordered list.
#[async_trait]
pub trait OwnedResource<C: ?Sized>: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Converge every target of this kind. Continues past failures and returns the first, preferring hard failures over retryable ones.
    async fn apply(&self, cluster: &C, ctx: &mut PassContext, app: &CompositeApp) -> Result<(), ApplyError>;

    async fn update_status(&self, cluster: &C, app: &CompositeApp, status: &mut CompositeAppStatus) -> Result<(), ApplyError>;
}

pub struct Child<T>(PhantomData<fn() -> T>);

impl<T> Child<T> {
    pub fn new() -> Self { Self(PhantomData) }
}

impl<T> Default for Child<T> {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl<C, T> OwnedResource<C> for Child<T>
where
    C: Store<T::Object> + ?Sized,
    T: ChildKind,
{
    fn kind(&self) -> &'static str { T::KIND }

    async fn apply(&self, cluster: &C, ctx: &mut PassContext, app: &CompositeApp) -> Result<(), ApplyError> {
        let namespace = app.namespace_or_default();
        let mut first: Option<ApplyError> = None;
        for target in targets(app, T::SCOPE) {
            if let Err(err) = engine::converge::<T, C>(cluster, ctx, app, &namespace, &target).await {
                warn!(kind = T::KIND, name = %target.name, error = %err, "child.apply_failed");
                if first.as_ref().map_or(true, |prev| prev.is_retryable() && !err.is_retryable()) {
                    first = Some(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn update_status(&self, cluster: &C, app: &CompositeApp, status: &mut CompositeAppStatus) -> Result<(), ApplyError> {
        if !T::OBSERVES { return Ok(()); }
        let namespace = app.namespace_or_default();
        for target in targets(app, T::SCOPE) {
            let observed = cluster.get(&namespace, &target.name).await.map_err(ApplyError::store(T::KIND, &target.name))?;
            T::observe(target.entry, observed.as_ref(), status);
        }
        Ok(())
    }
}

/// Child kinds in application order.
pub fn owned_resources<C: Cluster + ?Sized>() -> Vec<Box<dyn OwnedResource<C>>> {
    vec![
        Box::new(Child::<Workload>::new()),
        Box::new(Child::<NetworkEndpoint>::new()),
        Box::new(Child::<TrafficRouter>::new()),
        Box::new(Child::<Autoscaler>::new()),
        Box::new(Child::<DestinationPolicy>::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryCluster;

    #[test]
    fn kinds_are_ordered() {
        let kinds: Vec<_> = owned_resources::<MemoryCluster>().iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, ["Deployment", "Service", "VirtualService", "HorizontalPodAutoscaler", "DestinationRule"]);
    }
}
