//! Resolving the credentials of a managed object into cloud clients
use crate::{
    cluster::{self, Cluster, Object},
    dependency::Dependency,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use orc_core::{Error, ManagedObject, Phase, ReconcileStatus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The credentials in a secret could not be turned into a cloud scope
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("credentials secret has no {0:?} key")]
    MissingKey(String),

    #[error("credentials secret is malformed: {0}")]
    Malformed(String),

    #[error("cloud {0:?} is not defined in the credentials secret")]
    UnknownCloud(String),
}

/// Builds the per-pass cloud clients from a credentials secret
///
/// The returned scope must honour `cancel`: once it is cancelled, cloud calls made through the
/// scope fail with [`CloudError::Cancelled`](orc_core::CloudError::Cancelled).
#[async_trait]
pub trait ScopeFactory: Send + Sync + 'static {
    type Scope: Send + Sync + 'static;

    async fn new_scope(
        &self,
        credentials: &Secret,
        cloud_name: &str,
        cancel: CancellationToken,
    ) -> Result<Self::Scope, ScopeError>;
}

/// The guarded reference from a managed object to its credentials secret
pub fn credentials_dependency<S: Object + ManagedObject>(controller: &str) -> Dependency<S, Secret> {
    Dependency::guarded(controller, "spec.cloudCredentialsRef.secretName", |source: &S| {
        vec![source.credentials_ref().secret_name.clone()]
    })
}

fn cluster_error(err: cluster::Error) -> ReconcileStatus {
    ReconcileStatus::error(Error::retryable(err))
}

/// Fetch the credentials secret of `source`, guard it, and build a scope from it
///
/// A missing secret is waited for. The guard finalizer is not added to a secret which is
/// already being deleted, but such a secret is still used: the objects it guards may need it
/// to clean up.
pub async fn resolve<C, F, S>(
    cluster: &C,
    factory: &F,
    credentials: &Dependency<S, Secret>,
    source: &S,
    cancel: CancellationToken,
) -> Result<F::Scope, ReconcileStatus>
where
    C: Cluster,
    F: ScopeFactory,
    S: Object + ManagedObject,
{
    let namespace = source.namespace().unwrap_or_default();
    let credentials_ref = source.credentials_ref();
    let secret_name = credentials_ref.secret_name.as_str();

    let secret = match cluster.get::<Secret>(&namespace, secret_name).await {
        Ok(Some(secret)) => secret,
        Ok(None) => return Err(ReconcileStatus::waiting_on_object("Secret", secret_name, Phase::Create)),
        Err(err) => return Err(cluster_error(err)),
    };

    if let Some(guard) = credentials.deletion_guard() {
        let guarded = secret.finalizers().iter().any(|f| *f == guard.finalizer);
        if !guarded && secret.metadata.deletion_timestamp.is_none() {
            debug!(secret = secret_name, "adding credentials guard");
            let patch = cluster::finalizer_patch::<Secret>(secret_name, Some(&guard.finalizer));
            cluster
                .apply::<Secret>(&namespace, secret_name, &guard.field_owner, &patch)
                .await
                .map_err(cluster_error)?;
        }
    }

    factory
        .new_scope(&secret, &credentials_ref.cloud_name, cancel)
        .await
        .map_err(|err| ReconcileStatus::error(Error::retryable(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures::*, FakeCluster};
    use orc_core::Severity;

    #[tokio::test]
    async fn missing_secrets_are_waited_for() {
        let cluster = FakeCluster::default();
        let source = cluster.create(thing("a", None)).unwrap();
        let status = resolve(
            &cluster,
            &FakeScopes::default(),
            &credentials_dependency::<Thing>("thing"),
            &source,
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status.messages(), vec!["Waiting for Secret/creds to be Created"]);
    }

    #[tokio::test]
    async fn secrets_are_guarded_once_used() {
        let cluster = FakeCluster::default();
        cluster.create(secret("creds", "openstack")).unwrap();
        let source = cluster.create(thing("a", None)).unwrap();
        let scopes = FakeScopes::default();
        let credentials = credentials_dependency::<Thing>("thing");

        assert!(resolve(&cluster, &scopes, &credentials, &source, CancellationToken::new())
            .await
            .is_ok());
        let secret = cluster.object::<Secret>("ns", "creds").unwrap();
        assert_eq!(secret.finalizers(), &["openstack.k-orc.cloud/thing".to_string()]);

        assert!(resolve(&cluster, &scopes, &credentials, &source, CancellationToken::new())
            .await
            .is_ok());
        assert_eq!(cluster.patches().len(), 1);
    }

    #[tokio::test]
    async fn malformed_secrets_are_retried() {
        let cluster = FakeCluster::default();
        cluster.create(secret("creds", "some-other-cloud")).unwrap();
        let source = cluster.create(thing("a", None)).unwrap();
        let status = resolve(
            &cluster,
            &FakeScopes::default(),
            &credentials_dependency::<Thing>("thing"),
            &source,
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status.severity(), Severity::Retryable);
    }
}
