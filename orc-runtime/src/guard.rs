//! Deletion guards
//!
//! A guarded [`Dependency`] keeps a finalizer on every target which is referenced by at least
//! one source, so a `Network` cannot go away while a `Subnet` still names it. The finalizer is
//! added when a source first uses the target (see [`Dependency::fetch_with`]) and by the guard
//! controller below whenever a referencing source exists. The guard controller is also the only
//! place it is removed: once no source references the target any more.
use crate::{
    cluster::{self, Cluster, KubeCluster, Object},
    controller::Config,
    dependency::Dependency,
};
use futures::StreamExt;
use kube::{
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Client, ResourceExt,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before retrying a guard update which failed
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Maintains the deletion guard of one dependency on its targets
pub struct Guard<S, T, C> {
    dependency: Dependency<S, T>,
    cluster: C,
}

impl<S: Object, T: Object, C: Cluster> Guard<S, T, C> {
    pub fn new(dependency: Dependency<S, T>, cluster: C) -> Self {
        Self { dependency, cluster }
    }

    /// Bring the guard finalizer on `target` in line with its current sources
    pub async fn reconcile(&self, target: &T) -> Result<Action, cluster::Error> {
        let Some(guard) = self.dependency.deletion_guard() else {
            return Ok(Action::await_change());
        };
        let namespace = target.namespace().unwrap_or_default();
        let name = target.name_any();
        let Some(target) = self.cluster.get::<T>(&namespace, &name).await? else {
            return Ok(Action::await_change());
        };

        let sources = self.dependency.sources_for(&self.cluster, &namespace, &name).await?;
        let guarded = target.finalizers().iter().any(|f| *f == guard.finalizer);
        let deleting = target.meta().deletion_timestamp.is_some();

        let wanted = match (sources.is_empty(), guarded) {
            (false, false) if !deleting => Some(guard.finalizer.as_str()),
            (true, true) => None,
            _ => return Ok(Action::await_change()),
        };
        debug!(
            dependency = self.dependency.index_name(),
            target = %name,
            sources = sources.len(),
            guarded = wanted.is_some(),
            "updating deletion guard"
        );
        let patch = cluster::finalizer_patch::<T>(&name, wanted);
        self.cluster
            .apply::<T>(&namespace, &name, &guard.field_owner, &patch)
            .await?;
        Ok(Action::await_change())
    }
}

struct GuardContext<S, T> {
    guard: Guard<S, T, KubeCluster>,
}

async fn reconcile<S: Object, T: Object>(
    target: Arc<T>,
    ctx: Arc<GuardContext<S, T>>,
) -> Result<Action, cluster::Error> {
    ctx.guard.reconcile(&target).await
}

fn error_policy<S: Object, T: Object>(target: Arc<T>, err: &cluster::Error, _: Arc<GuardContext<S, T>>) -> Action {
    warn!(target = %target.name_any(), %err, "deletion guard update failed");
    Action::requeue(RETRY_DELAY)
}

/// Run the guard controller of `dependency` until `shutdown` is cancelled
///
/// Watches the targets, and the sources mapped to the targets they reference, so that removing a
/// reference from the last source releases the target.
pub async fn run<S: Object, T: Object>(
    client: Client,
    dependency: Dependency<S, T>,
    config: Config,
    shutdown: CancellationToken,
) {
    let Some(finalizer) = dependency.deletion_guard().map(|g| g.finalizer.clone()) else {
        return;
    };
    info!(
        dependency = dependency.index_name(),
        source = %S::kind(&()),
        target = %T::kind(&()),
        %finalizer,
        "starting deletion guard"
    );

    let mapper = dependency.clone();
    let ctx = Arc::new(GuardContext {
        guard: Guard::new(dependency, KubeCluster::new(client.clone())),
    });
    Controller::new(config.api::<T>(&client), watcher::Config::default())
        .watches(config.api::<S>(&client), watcher::Config::default(), move |source: S| {
            let namespace = source.namespace().unwrap_or_default();
            mapper
                .referenced(&source)
                .into_iter()
                .map(|name| ObjectRef::<T>::new(&name).within(&namespace))
                .collect::<Vec<_>>()
        })
        .with_config(config.runtime())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                debug!(%err, "deletion guard reconcile failed");
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures::*, FakeCluster};

    fn guard(cluster: &FakeCluster) -> Guard<Thing, Thing, FakeCluster> {
        Guard::new(parent_dependency(), cluster.clone())
    }

    fn finalizers(cluster: &FakeCluster, name: &str) -> Vec<String> {
        cluster.object::<Thing>("ns", name).unwrap().finalizers().to_vec()
    }

    #[tokio::test]
    async fn referenced_targets_are_guarded() {
        let cluster = FakeCluster::default();
        let parent = cluster.create(thing("parent", None)).unwrap();
        cluster.create(thing("child", Some("parent"))).unwrap();

        guard(&cluster).reconcile(&parent).await.unwrap();
        assert_eq!(finalizers(&cluster, "parent"), vec!["openstack.k-orc.cloud/thing"]);

        guard(&cluster).reconcile(&parent).await.unwrap();
        assert_eq!(cluster.patches().len(), 1);
    }

    #[tokio::test]
    async fn guards_are_released_with_the_last_reference() {
        let cluster = FakeCluster::default();
        let parent = cluster.create(thing("parent", None)).unwrap();
        cluster.create(thing("child", Some("parent"))).unwrap();
        guard(&cluster).reconcile(&parent).await.unwrap();

        cluster.delete::<Thing>("ns", "parent").unwrap();
        guard(&cluster).reconcile(&parent).await.unwrap();
        assert!(cluster.exists::<Thing>("ns", "parent"));

        cluster.delete::<Thing>("ns", "child").unwrap();
        guard(&cluster).reconcile(&parent).await.unwrap();
        assert!(!cluster.exists::<Thing>("ns", "parent"));
    }

    #[tokio::test]
    async fn deleting_targets_are_not_newly_guarded() {
        let cluster = FakeCluster::default();
        let mut parent = thing("parent", None);
        parent.metadata.finalizers = Some(vec!["example.com/keep".into()]);
        let parent = cluster.create(parent).unwrap();
        cluster.delete::<Thing>("ns", "parent").unwrap();
        cluster.create(thing("child", Some("parent"))).unwrap();

        guard(&cluster).reconcile(&parent).await.unwrap();
        assert_eq!(finalizers(&cluster, "parent"), vec!["example.com/keep"]);
        assert!(cluster.patches().is_empty());
    }

    #[tokio::test]
    async fn unguarded_dependencies_do_nothing() {
        let cluster = FakeCluster::default();
        let parent = cluster.create(thing("parent", None)).unwrap();
        cluster.create(thing("child", Some("parent"))).unwrap();
        let unguarded = Dependency::<Thing, Thing>::new("spec.resource.parentRef", |t: &Thing| {
            t.spec.resource.iter().filter_map(|r| r.parent_ref.clone()).collect()
        });
        Guard::new(unguarded, cluster.clone()).reconcile(&parent).await.unwrap();
        assert!(cluster.patches().is_empty());
    }
}
