use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, autoscaling::v1::HorizontalPodAutoscaler, core::v1::Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::api::CompositeApp;
use crate::istio::{DestinationRule, VirtualService};

pub const FIELD_MANAGER: &str = "composite-operator";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("client error: {0}")]
    Kube(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound,
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message),
            kube::Error::Api(ae) => Self::Api { code: ae.code, message: ae.message },
            kube::Error::SerdeError(e) => Self::Serialize(e),
            other => Self::Kube(other.to_string()),
        }
    }
}

/// Namespaced read/write access to one object kind.
#[async_trait]
pub trait Store<K>: Send + Sync {
    /// Point lookup; a missing object is `Ok(None)`.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    /// Full replace guarded by the object's `resourceVersion`.
    async fn replace(&self, obj: &K) -> Result<K, StoreError>;
    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Kinds with a status subresource.
#[async_trait]
pub trait StatusStore<K>: Store<K> {
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// Everything a reconcile pass reads or writes.
pub trait Cluster:
    Store<Deployment>
    + Store<Service>
    + Store<HorizontalPodAutoscaler>
    + Store<VirtualService>
    + Store<DestinationRule>
    + StatusStore<CompositeApp>
    + 'static
{
}

impl<T> Cluster for T where
    T: Store<Deployment>
        + Store<Service>
        + Store<HorizontalPodAutoscaler>
        + Store<VirtualService>
        + Store<DestinationRule>
        + StatusStore<CompositeApp>
        + 'static
{
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        self.api(&obj.namespace().unwrap_or_else(|| "default".into()))
    }
}

fn post_params() -> PostParams { PostParams { field_manager: Some(FIELD_MANAGER.into()), ..Default::default() } }

#[async_trait]
impl<K> Store<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> { Ok(self.api::<K>(namespace).get_opt(name).await?) }

    async fn create(&self, obj: &K) -> Result<K, StoreError> { Ok(self.api_for(obj).create(&post_params(), obj).await?) }

    async fn replace(&self, obj: &K) -> Result<K, StoreError> { Ok(self.api_for(obj).replace(&obj.name_any(), &post_params(), obj).await?) }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl<K> StatusStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn replace_status(&self, obj: &K) -> Result<K, StoreError> {
        let body = serde_json::to_vec(obj)?;
        Ok(self.api_for(obj).replace_status(&obj.name_any(), &post_params(), body).await?)
    }
}
