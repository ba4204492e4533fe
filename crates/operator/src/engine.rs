//! Point lookup, decide, write: the convergence step for one child object.
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::api::CompositeApp;
use crate::children::{ChildKind, Desired, Target};
use crate::context::PassContext;
use crate::error::ApplyError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// Bring one child of kind `T` in line with the parent.
pub async fn converge<T, S>(store: &S, ctx: &mut PassContext, owner: &CompositeApp, namespace: &str, target: &Target<'_>) -> Result<Outcome, ApplyError>
where
    T: ChildKind,
    S: Store<T::Object> + ?Sized,
{
    let name = target.name.as_str();
    let observed = store.get(namespace, name).await.map_err(ApplyError::store(T::KIND, name))?;
    let desired = T::generate(owner, target.entry, observed.as_ref());
    if observed.as_ref().is_some_and(|o| o.meta().deletion_timestamp.is_some()) {
        debug!(kind = T::KIND, name, "child.terminating");
        if matches!(desired, Desired::Present(_)) {
            return Err(ApplyError::Terminating { kind: T::KIND, name: name.to_string() });
        }
        ctx.record(T::KIND, name, Outcome::Unchanged);
        return Ok(Outcome::Unchanged);
    }
    let outcome = match (desired, observed) {
        (Desired::Absent | Desired::Unmanaged, None) | (Desired::Unmanaged, Some(_)) => Outcome::Unchanged,
        (Desired::Absent, Some(_)) => {
            store.delete(namespace, name).await.map_err(ApplyError::store(T::KIND, name))?;
            info!(kind = T::KIND, name, "child.deleted");
            Outcome::Deleted
        }
        (Desired::Present(mut obj), None) => {
            claim::<T>(&mut obj, owner, name)?;
            store.create(&obj).await.map_err(ApplyError::store(T::KIND, name))?;
            info!(kind = T::KIND, name, "child.created");
            Outcome::Created
        }
        (Desired::Present(mut obj), Some(current)) => {
            let (wanted, found) = (T::project(&obj), T::project(&current));
            if wanted == found && owned_by(&current, owner) {
                Outcome::Unchanged
            } else {
                debug!(kind = T::KIND, name, desired = ?wanted, observed = ?found, "child.drift");
                claim::<T>(&mut obj, owner, name)?;
                T::prepare_update(&mut obj, &current);
                store.replace(&obj).await.map_err(ApplyError::store(T::KIND, name))?;
                info!(kind = T::KIND, name, "child.updated");
                Outcome::Updated
            }
        }
    };
    ctx.record(T::KIND, name, outcome);
    Ok(outcome)
}

/// Stamp the controller owner reference so deleting the parent cascades.
fn claim<T: ChildKind>(obj: &mut T::Object, owner: &CompositeApp, name: &str) -> Result<(), ApplyError> {
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| ApplyError::OwnerReference { kind: T::KIND, name: name.to_string(), owner: owner.name_any() })?;
    obj.meta_mut().owner_references = Some(vec![owner_ref]);
    Ok(())
}

fn owned_by<K: Resource>(obj: &K, owner: &CompositeApp) -> bool {
    let Some(uid) = owner.uid() else { return false };
    obj.owner_references().iter().any(|r| r.uid == uid && r.controller == Some(true))
}
