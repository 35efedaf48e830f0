//! Access to the Kubernetes API server
//!
//! The engine never talks to [`kube::Api`] directly. Everything it reads and writes goes through
//! [`Cluster`], which is small enough to be modelled in memory by
//! [`FakeCluster`](crate::testing::FakeCluster).
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use thiserror::Error;

/// Any namespaced Kubernetes object the engine can read and patch
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api request failed: {0}")]
    Api(#[source] kube::Error),

    #[error("failed to serialize {0}: {1}")]
    Serialization(String, #[source] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::Api(err)
    }
}

/// A server-side apply patch setting the finalizers owned by the applying field manager
///
/// Applying with `None` releases every finalizer the manager owns.
pub fn finalizer_patch<K: Object>(name: &str, finalizer: Option<&str>) -> Value {
    let mut metadata = serde_json::json!({ "name": name });
    if let Some(finalizer) = finalizer {
        metadata["finalizers"] = serde_json::json!([finalizer]);
    }
    serde_json::json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": metadata,
    })
}

/// The API server operations used by the engine
///
/// Every write is a patch on an existing object. Server-side apply patches are always forced:
/// a field manager only ever applies the fields it owns, so a conflict means another writer has
/// grabbed one of them and we want it back.
#[async_trait]
pub trait Cluster: Clone + Send + Sync + 'static {
    /// Read an object, `None` if it does not exist
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>;

    /// List every object of a kind in a namespace
    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>, Error>;

    /// Server-side apply `patch` to the main resource as `field_owner`
    async fn apply<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error>;

    /// Server-side apply `patch` to the status subresource as `field_owner`
    async fn apply_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error>;

    /// JSON merge patch the status subresource
    async fn merge_status<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, Error>;
}

/// [`Cluster`] backed by a [`kube::Client`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>, Error> {
        Ok(self.api::<K>(namespace).list(&ListParams::default()).await?.items)
    }

    async fn apply<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        let params = PatchParams::apply(field_owner).force();
        Ok(self
            .api::<K>(namespace)
            .patch(name, &params, &Patch::Apply(patch))
            .await?)
    }

    async fn apply_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        let params = PatchParams::apply(field_owner).force();
        Ok(self
            .api::<K>(namespace)
            .patch_status(name, &params, &Patch::Apply(patch))
            .await?)
    }

    async fn merge_status<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, Error> {
        Ok(self
            .api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }
}
