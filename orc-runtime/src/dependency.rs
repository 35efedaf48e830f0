//! References from one managed object to another
//!
//! A [`Dependency`] describes how objects of a source kind `S` name objects of a target kind `T`
//! in the same namespace, for example a `Subnet` naming its `Network` in
//! `spec.resource.networkRef`. From that one description the engine derives:
//!
//! - the sources which reference a given target ([`Dependency::sources_for`]),
//! - which sources to reconcile when a target becomes available ([`BecameAvailable`]),
//! - whether every target referenced by a source is ready ([`Dependency::fetch`]),
//! - the deletion guard which keeps targets alive while sources still reference them, when
//!   the dependency is guarded (see [`crate::guard`]).
use crate::cluster::{self, Cluster, Object};
use kube::{runtime::reflector::ObjectRef, Resource, ResourceExt};
use orc_core::{naming, ConditionReason, ManagedObject, Phase, ReconcileStatus};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    marker::PhantomData,
    sync::Arc,
};
use tracing::trace;

/// The finalizer and field manager a source controller uses to guard targets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletionGuard {
    pub finalizer: String,
    pub field_owner: String,
}

/// A reference from objects of kind `S` to objects of kind `T`
pub struct Dependency<S, T> {
    index_name: &'static str,
    extract: fn(&S) -> Vec<String>,
    guard: Option<DeletionGuard>,
    _target: PhantomData<fn() -> T>,
}

impl<S, T> Clone for Dependency<S, T> {
    fn clone(&self) -> Self {
        Self {
            index_name: self.index_name,
            extract: self.extract,
            guard: self.guard.clone(),
            _target: PhantomData,
        }
    }
}

impl<S: Object, T: Object> Dependency<S, T> {
    /// An unguarded reference, such as a name used in an import filter
    ///
    /// `index_name` is the path of the reference in the source, used in logs.
    pub fn new(index_name: &'static str, extract: fn(&S) -> Vec<String>) -> Self {
        Self {
            index_name,
            extract,
            guard: None,
            _target: PhantomData,
        }
    }

    /// A reference which prevents targets from being deleted while sources hold it
    ///
    /// The guard finalizer is named after the source controller, and written under a field
    /// manager dedicated to this target kind.
    pub fn guarded(controller: &str, index_name: &'static str, extract: fn(&S) -> Vec<String>) -> Self {
        let target_kind = T::kind(&());
        Self {
            guard: Some(DeletionGuard {
                finalizer: naming::finalizer(controller),
                field_owner: naming::guard_field_owner(controller, &target_kind),
            }),
            ..Self::new(index_name, extract)
        }
    }

    pub fn index_name(&self) -> &'static str {
        self.index_name
    }

    pub fn deletion_guard(&self) -> Option<&DeletionGuard> {
        self.guard.as_ref()
    }

    /// The target names referenced by `source`, deduplicated and sorted
    pub fn referenced(&self, source: &S) -> Vec<String> {
        (self.extract)(source)
            .into_iter()
            .filter(|name| !name.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether `source` references the target `name`
    pub fn references(&self, source: &S, name: &str) -> bool {
        (self.extract)(source).iter().any(|n| n == name)
    }

    /// Every source in `namespace` which references the target `name`
    pub async fn sources_for<C: Cluster>(
        &self,
        cluster: &C,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<S>, cluster::Error> {
        Ok(cluster
            .list::<S>(namespace)
            .await?
            .into_iter()
            .filter(|source| self.references(source, name))
            .collect())
    }

    /// References to the sources in `sources` which reference `target`
    pub fn requests_for(&self, sources: &[Arc<S>], target: &T) -> Vec<ObjectRef<S>> {
        let namespace = target.namespace();
        let name = target.name_any();
        sources
            .iter()
            .filter(|source| source.namespace() == namespace && self.references(source, &name))
            .map(|source| ObjectRef::from_obj(source.as_ref()))
            .collect()
    }

    /// Put the guard finalizer on `target` if the reference is guarded and it is missing
    async fn ensure_guarded<C: Cluster>(&self, cluster: &C, namespace: &str, target: &T) -> Result<(), cluster::Error> {
        let Some(guard) = &self.guard else {
            return Ok(());
        };
        if target.finalizers().iter().any(|f| *f == guard.finalizer) {
            return Ok(());
        }
        let name = target.name_any();
        trace!(dependency = self.index_name, target = %name, "adding deletion guard");
        let patch = cluster::finalizer_patch::<T>(&name, Some(&guard.finalizer));
        cluster
            .apply::<T>(namespace, &name, &guard.field_owner, &patch)
            .await
            .map(|_| ())
    }

    /// Fetch every target referenced by `source`, reporting any which is not `ready`
    ///
    /// Returns the ready targets by name, each carrying the guard finalizer when the reference is
    /// guarded. A missing target is waited for when the reference is guarded, and is a
    /// `DependencyNotFound` error otherwise. A target which is being deleted is waited for until
    /// it is gone.
    pub async fn fetch_with<C: Cluster>(
        &self,
        cluster: &C,
        source: &S,
        ready: impl Fn(&T) -> bool + Send,
    ) -> (BTreeMap<String, T>, ReconcileStatus) {
        let namespace = source.namespace().unwrap_or_default();
        let kind = T::kind(&()).to_string();
        let mut found = BTreeMap::new();
        let mut status = ReconcileStatus::ok();

        for name in self.referenced(source) {
            let next = match cluster.get::<T>(&namespace, &name).await {
                Err(err) => ReconcileStatus::error(orc_core::Error::retryable(err)),
                Ok(None) if self.guard.is_some() => ReconcileStatus::waiting_on_object(&kind, &name, Phase::Create),
                Ok(None) => ReconcileStatus::terminal(
                    ConditionReason::DependencyNotFound,
                    format!("{kind}/{name} referenced by {} not found", self.index_name),
                ),
                Ok(Some(target)) if target.meta().deletion_timestamp.is_some() => {
                    ReconcileStatus::waiting_on_object(&kind, &name, Phase::Delete)
                }
                Ok(Some(target)) if !ready(&target) => {
                    ReconcileStatus::waiting_on_object(&kind, &name, Phase::Ready)
                }
                Ok(Some(target)) => match self.ensure_guarded(cluster, &namespace, &target).await {
                    Ok(()) => {
                        found.insert(name, target);
                        continue;
                    }
                    Err(err) => ReconcileStatus::error(orc_core::Error::retryable(err)),
                },
            };
            trace!(dependency = self.index_name, %next, "dependency not ready");
            status = status.merge(next);
        }
        (found, status)
    }
}

impl<S: Object, T: Object + ManagedObject> Dependency<S, T> {
    /// [`Dependency::fetch_with`] using the managed object readiness of the target
    pub async fn fetch<C: Cluster>(&self, cluster: &C, source: &S) -> (BTreeMap<String, T>, ReconcileStatus) {
        self.fetch_with(cluster, source, |target: &T| target.is_available()).await
    }

    /// Fetch the single target referenced by `source`, if it references one
    pub async fn fetch_one<C: Cluster>(
        &self,
        cluster: &C,
        source: &S,
    ) -> Result<Option<T>, ReconcileStatus> {
        let (mut found, status) = self.fetch(cluster, source).await;
        if status.needs_reschedule() {
            return Err(status);
        }
        Ok(self.referenced(source).first().and_then(|name| found.remove(name)))
    }
}

/// Tracks which targets have been seen available, to reconcile sources on the transition only
///
/// Every update of a target passes through the watch; forwarding each one to every source would
/// reconcile all of them on every status write of the target.
pub struct BecameAvailable<T: Object> {
    seen: Arc<Mutex<HashMap<ObjectRef<T>, bool>>>,
    ready: fn(&T) -> bool,
}

impl<T: Object> Clone for BecameAvailable<T> {
    fn clone(&self) -> Self {
        Self {
            seen: self.seen.clone(),
            ready: self.ready,
        }
    }
}

impl<T: Object> BecameAvailable<T> {
    pub fn new(ready: fn(&T) -> bool) -> Self {
        Self {
            seen: Arc::default(),
            ready,
        }
    }

    /// Record the current state of `target`, returning whether it just became available
    ///
    /// A target which is being deleted is forgotten.
    pub fn observe(&self, target: &T) -> bool {
        let key = ObjectRef::from_obj(target);
        if target.meta().deletion_timestamp.is_some() {
            self.seen.lock().remove(&key);
            return false;
        }
        let now = (self.ready)(target);
        let before = self.seen.lock().insert(key, now);
        now && before != Some(true)
    }

    /// How many targets are remembered
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures::*, FakeCluster};
    use k8s_openapi::api::core::v1::Secret;

    fn network_ref() -> Dependency<Thing, Thing> {
        Dependency::guarded("thing", "spec.resource.parentRef", |t: &Thing| {
            t.spec.resource.iter().filter_map(|r| r.parent_ref.clone()).collect()
        })
    }

    #[test]
    fn guarded_dependencies_are_named_after_the_source_controller() {
        let guard = network_ref().deletion_guard().cloned().unwrap();
        assert_eq!(guard.finalizer, "openstack.k-orc.cloud/thing");
        assert_eq!(guard.field_owner, "openstack.k-orc.cloud/thingcontroller/thing");

        let credentials: Dependency<Thing, Secret> = Dependency::guarded("thing", "spec.cloudCredentialsRef", |_| vec![]);
        assert_eq!(
            credentials.deletion_guard().unwrap().field_owner,
            "openstack.k-orc.cloud/thingcontroller/secret"
        );
    }

    #[tokio::test]
    async fn fetch_reports_missing_and_unready_targets() {
        let cluster = FakeCluster::default();
        let child = cluster.create(thing("child", Some("parent"))).unwrap();

        let (found, status) = network_ref().fetch(&cluster, &child).await;
        assert!(found.is_empty());
        assert_eq!(status.messages(), vec!["Waiting for Thing/parent to be Created"]);

        cluster.create(thing("parent", None)).unwrap();
        let (_, status) = network_ref().fetch(&cluster, &child).await;
        assert_eq!(status.messages(), vec!["Waiting for Thing/parent to be Ready"]);

        cluster.set_available::<Thing>("ns", "parent", "p-id").unwrap();
        let (found, status) = network_ref().fetch(&cluster, &child).await;
        assert!(status.is_ok());
        assert!(found.contains_key("parent"));
        let parent = cluster.object::<Thing>("ns", "parent").unwrap();
        assert_eq!(parent.finalizers(), &["openstack.k-orc.cloud/thing".to_string()]);
    }

    #[tokio::test]
    async fn unguarded_missing_targets_are_not_found() {
        let cluster = FakeCluster::default();
        let child = cluster.create(thing("child", Some("parent"))).unwrap();
        let filter_ref: Dependency<Thing, Thing> = Dependency::new("spec.import.filter.parentRef", |t: &Thing| {
            t.spec.resource.iter().filter_map(|r| r.parent_ref.clone()).collect()
        });
        let (_, status) = filter_ref.fetch(&cluster, &child).await;
        assert_eq!(
            status.terminal_error().map(|(reason, _)| reason),
            Some(ConditionReason::DependencyNotFound)
        );
    }

    #[tokio::test]
    async fn sources_are_found_by_target_name() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", Some("parent"))).unwrap();
        cluster.create(thing("b", Some("other"))).unwrap();
        cluster.create(thing("c", Some("parent"))).unwrap();
        let names = network_ref()
            .sources_for(&cluster, "ns", "parent")
            .await
            .unwrap()
            .iter()
            .map(ResourceExt::name_any)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn availability_transitions_are_reported_once() {
        let tracker = BecameAvailable::<Thing>::new(|t| t.is_available());
        let mut parent = thing("parent", None);
        assert!(!tracker.observe(&parent));
        mark_available(&mut parent, "p-id");
        assert!(tracker.observe(&parent));
        assert!(!tracker.observe(&parent));
    }

    #[test]
    fn deleted_targets_are_forgotten() {
        let cluster = FakeCluster::default();
        let tracker = BecameAvailable::<Thing>::new(|t| t.is_available());
        let mut parent = thing("parent", None);
        parent.meta_mut().finalizers = Some(vec!["example.com/keep".into()]);
        mark_available(&mut parent, "p-id");
        assert!(tracker.observe(&parent));
        assert_eq!(tracker.len(), 1);

        cluster.create(parent).unwrap();

        cluster.delete::<Thing>("ns", "parent").unwrap();
        let deleted = cluster.object::<Thing>("ns", "parent").unwrap();
        assert!(!tracker.observe(&deleted));
        assert!(tracker.is_empty());
    }

    #[test]
    fn requests_only_name_referencing_sources() {
        let sources = vec![
            Arc::new(thing("a", Some("parent"))),
            Arc::new(thing("b", Some("other"))),
        ];
        let requests = network_ref().requests_for(&sources, &thing("parent", None));
        assert_eq!(requests, vec![ObjectRef::new("a").within("ns")]);
    }
}
