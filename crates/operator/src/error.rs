use thiserror::Error;

pub use crate::api::ValidationError;
pub use crate::store::StoreError;

/// Failure converging a single child object. The pass records it and moves on.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{kind} {name}: {source}")]
    Store { kind: &'static str, name: String, source: StoreError },
    #[error("{kind} {name}: owner {owner} has no uid, cannot set owner reference")]
    OwnerReference { kind: &'static str, name: String, owner: String },
    #[error("{kind} {name}: still terminating")]
    Terminating { kind: &'static str, name: String },
}

impl ApplyError {
    pub fn store<'a>(kind: &'static str, name: &'a str) -> impl FnOnce(StoreError) -> Self + 'a {
        move |source| Self::Store { kind, name: name.to_string(), source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store { kind, .. } | Self::OwnerReference { kind, .. } | Self::Terminating { kind, .. } => kind,
        }
    }

    /// Lost a race with another writer or the garbage collector; the next pass will settle it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { source: StoreError::Conflict(_), .. } | Self::Terminating { .. })
    }
}

/// Pass-level failure; the controller requeues with backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pre-delete hook failed: {0:#}")]
    Hook(anyhow::Error),
    #[error("reconcile pass panicked: {0}")]
    Panic(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_terminating_children_are_retryable() {
        assert!(ApplyError::store("Deployment", "shop-v1")(StoreError::Conflict("stale".into())).is_retryable());
        assert!(ApplyError::Terminating { kind: "Service", name: "shop".into() }.is_retryable());
        assert!(!ApplyError::store("Deployment", "shop-v1")(StoreError::Api { code: 500, message: "boom".into() }).is_retryable());
    }
}
