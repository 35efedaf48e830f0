//! An in-memory model of the API server for tests
//!
//! [`FakeCluster`] implements [`Cluster`] over a map of JSON documents. It models the parts of
//! the API server the engine relies on:
//!
//! - `metadata.finalizers` is a set shared between field managers: each server-side apply
//!   replaces the entries owned by its manager and leaves the others alone,
//! - top level `status` fields are owned by the manager which last applied them, and dropped
//!   when that manager stops applying them,
//! - deleting an object with finalizers only sets `deletionTimestamp`; the object goes away when
//!   its last finalizer is removed, and no finalizer may be added in the meantime,
//! - spec changes bump `metadata.generation`.
//!
//! Every patch is recorded so tests can assert on exactly what was written.
use crate::cluster::{Cluster, Error, Object};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

#[cfg(test)]
pub(crate) mod fixtures;

/// The field manager owning finalizers present when an object is created
pub const CREATOR: &str = "kubectl-create";

/// Which endpoint a patch was sent to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    Apply,
    ApplyStatus,
    MergeStatus,
}

/// A patch received by a [`FakeCluster`]
#[derive(Clone, Debug)]
pub struct PatchRecord {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub patch_kind: PatchKind,
    pub field_owner: Option<String>,
    pub body: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl Key {
    fn of<K: Object>(namespace: &str, name: &str) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

struct Stored {
    body: Value,
    finalizer_owners: BTreeMap<String, Vec<String>>,
    status_owners: BTreeMap<String, BTreeSet<String>>,
}

impl Stored {
    fn finalizers(&self) -> Vec<String> {
        self.body
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn is_deleting(&self) -> bool {
        self.body.pointer("/metadata/deletionTimestamp").is_some()
    }

    fn set_owned_finalizers(&mut self, owner: &str, owned: Vec<String>) -> Result<(), Error> {
        let current = self.finalizers();
        if self.is_deleting() {
            if let Some(new) = owned.iter().find(|f| !current.contains(f)) {
                return Err(Error::Rejected(format!(
                    "finalizer {new}: no new finalizers can be added if the object is being deleted"
                )));
            }
        }
        if owned.is_empty() {
            self.finalizer_owners.remove(owner);
        } else {
            self.finalizer_owners.insert(owner.to_string(), owned);
        }

        let wanted = self.finalizer_owners.values().flatten().cloned().collect::<BTreeSet<_>>();
        let mut next = current.into_iter().filter(|f| wanted.contains(f)).collect::<Vec<_>>();
        for owned in self.finalizer_owners.values() {
            for f in owned {
                if !next.contains(f) {
                    next.push(f.clone());
                }
            }
        }
        let meta = metadata_mut(&mut self.body);
        if next.is_empty() {
            meta.remove("finalizers");
        } else {
            meta.insert("finalizers".into(), json!(next));
        }
        Ok(())
    }

    fn apply_status_fields(&mut self, owner: &str, fields: Map<String, Value>) {
        let previous = self.status_owners.remove(owner).unwrap_or_default();
        let still_owned = self.status_owners.values().flatten().cloned().collect::<BTreeSet<_>>();
        let status = status_mut(&mut self.body);
        for dropped in previous.iter().filter(|k| !fields.contains_key(*k) && !still_owned.contains(*k)) {
            status.remove(dropped);
        }
        let keys = fields.keys().cloned().collect::<BTreeSet<_>>();
        for (key, value) in fields {
            status.insert(key, value);
        }
        self.status_owners.insert(owner.to_string(), keys);
    }
}

fn metadata_mut(body: &mut Value) -> &mut Map<String, Value> {
    object_field(body, "metadata")
}

fn status_mut(body: &mut Value) -> &mut Map<String, Value> {
    object_field(body, "status")
}

fn object_field<'a>(body: &'a mut Value, field: &str) -> &'a mut Map<String, Value> {
    if !body.is_object() {
        *body = json!({});
    }
    let Value::Object(map) = body else {
        unreachable!("body was just made an object")
    };
    let entry = map.entry(field.to_string()).or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("field was just made an object"),
    }
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = json!({});
            }
            if let Value::Object(map) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Stored>,
    patches: Vec<PatchRecord>,
    revision: u64,
    failures: VecDeque<String>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_failure(&mut self) -> Result<(), Error> {
        match self.failures.pop_front() {
            Some(message) => Err(Error::Rejected(message)),
            None => Ok(()),
        }
    }

    fn record(&mut self, key: &Key, patch_kind: PatchKind, field_owner: Option<&str>, body: &Value) {
        self.patches.push(PatchRecord {
            kind: key.kind.clone(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            patch_kind,
            field_owner: field_owner.map(str::to_string),
            body: body.clone(),
        });
    }

    fn touch(&mut self, key: &Key) {
        let revision = self.next_revision();
        if let Some(stored) = self.objects.get_mut(key) {
            metadata_mut(&mut stored.body).insert("resourceVersion".into(), json!(revision));
        }
    }
}

fn decode<K: Object>(key: &Key, body: &Value) -> Result<K, Error> {
    serde_json::from_value(body.clone()).map_err(|err| Error::Serialization(key.to_string(), err))
}

/// An in-memory API server
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// Store a new object, as `kubectl create` would
    pub fn create<K: Object>(&self, obj: K) -> Result<K, Error> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::Rejected("namespace is required".into()))?;
        let key = Key::of::<K>(&namespace, &obj.name_any());
        let mut body = serde_json::to_value(&obj).map_err(|err| Error::Serialization(key.to_string(), err))?;
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::Rejected(format!("{key} already exists")));
        }
        let revision = state.next_revision();
        let meta = metadata_mut(&mut body);
        meta.insert("uid".into(), json!(format!("uid-{revision}")));
        meta.insert("generation".into(), json!(1));
        meta.insert("resourceVersion".into(), json!(revision));
        let mut stored = Stored {
            body,
            finalizer_owners: BTreeMap::new(),
            status_owners: BTreeMap::new(),
        };
        let initial = stored.finalizers();
        if !initial.is_empty() {
            stored.finalizer_owners.insert(CREATOR.to_string(), initial);
        }
        let created = decode(&key, &stored.body)?;
        state.objects.insert(key, stored);
        Ok(created)
    }

    /// Read an object without going through [`Cluster`]
    pub fn object<K: Object>(&self, namespace: &str, name: &str) -> Option<K> {
        let key = Key::of::<K>(namespace, name);
        let state = self.state.lock();
        state.objects.get(&key).and_then(|stored| decode(&key, &stored.body).ok())
    }

    /// Whether an object exists, including while it is being deleted
    pub fn exists<K: Object>(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().objects.contains_key(&Key::of::<K>(namespace, name))
    }

    /// Edit an object's spec, as a user would; bumps the generation when the spec changed
    pub fn update<K: Object>(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut K)) -> Result<K, Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut obj: K = decode(&key, &stored.body)?;
        edit(&mut obj);
        let edited = serde_json::to_value(&obj).map_err(|err| Error::Serialization(key.to_string(), err))?;
        let new_spec = edited.get("spec").cloned().unwrap_or(Value::Null);
        let old_spec = stored.body.get("spec").cloned().unwrap_or(Value::Null);
        if new_spec != old_spec {
            if let Value::Object(map) = &mut stored.body {
                map.insert("spec".into(), new_spec);
            }
            let generation = stored
                .body
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            metadata_mut(&mut stored.body).insert("generation".into(), json!(generation + 1));
        }
        state.touch(&key);
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        decode(&key, &stored.body)
    }

    /// Delete an object, as `kubectl delete` would
    pub fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if stored.finalizers().is_empty() {
            state.objects.remove(&key);
            return Ok(());
        }
        if !stored.is_deleting() {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            metadata_mut(&mut stored.body).insert("deletionTimestamp".into(), json!(now));
            state.touch(&key);
        }
        Ok(())
    }

    /// Mark a managed object as having an OpenStack ID and being available
    pub fn set_available<K: Object>(&self, namespace: &str, name: &str, id: &str) -> Result<(), Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        merge(
            &mut stored.body,
            &json!({"status": {
                "id": id,
                "conditions": [{
                    "type": "Available",
                    "status": "True",
                    "lastTransitionTime": "1970-01-01T00:00:00Z",
                    "reason": "Success",
                    "message": "OpenStack resource is available",
                }],
            }}),
        );
        state.touch(&key);
        Ok(())
    }

    /// Fail the next write with `message`
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.state.lock().failures.push_back(message.into());
    }

    /// Every patch received so far
    pub fn patches(&self) -> Vec<PatchRecord> {
        self.state.lock().patches.clone()
    }

    /// Patches of one kind received so far
    pub fn patches_of(&self, patch_kind: PatchKind) -> Vec<PatchRecord> {
        self.patches().into_iter().filter(|p| p.patch_kind == patch_kind).collect()
    }

    pub fn clear_patches(&self) {
        self.state.lock().patches.clear();
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error> {
        let key = Key::of::<K>(namespace, name);
        let state = self.state.lock();
        state
            .objects
            .get(&key)
            .map(|stored| decode(&key, &stored.body))
            .transpose()
    }

    async fn list<K: Object>(&self, namespace: &str) -> Result<Vec<K>, Error> {
        let probe = Key::of::<K>(namespace, "");
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|(key, _)| {
                key.api_version == probe.api_version && key.kind == probe.kind && key.namespace == namespace
            })
            .map(|(key, stored)| decode(key, &stored.body))
            .collect()
    }

    async fn apply<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        state.take_failure()?;
        state.record(&key, PatchKind::Apply, Some(field_owner), patch);
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let owned = patch
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        stored.set_owned_finalizers(field_owner, owned)?;
        let applied = decode(&key, &stored.body)?;
        if stored.is_deleting() && stored.finalizers().is_empty() {
            state.objects.remove(&key);
        } else {
            state.touch(&key);
        }
        Ok(applied)
    }

    async fn apply_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        field_owner: &str,
        patch: &Value,
    ) -> Result<K, Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        state.take_failure()?;
        state.record(&key, PatchKind::ApplyStatus, Some(field_owner), patch);
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let fields = patch
            .get("status")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        stored.apply_status_fields(field_owner, fields);
        state.touch(&key);
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        decode(&key, &stored.body)
    }

    async fn merge_status<K: Object>(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, Error> {
        let key = Key::of::<K>(namespace, name);
        let mut state = self.state.lock();
        state.take_failure()?;
        state.record(&key, PatchKind::MergeStatus, None, patch);
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(status) = patch.get("status") {
            merge(&mut stored.body, &json!({ "status": status }));
        }
        state.touch(&key);
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        decode(&key, &stored.body)
    }
}

#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    fn finalizer_patch(finalizers: &[&str]) -> Value {
        json!({
            "apiVersion": "test.k-orc.cloud/v1alpha1",
            "kind": "Thing",
            "metadata": {"name": "a", "finalizers": finalizers},
        })
    }

    #[tokio::test]
    async fn finalizers_are_owned_per_field_manager() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", None)).unwrap();

        let _: Thing = cluster.apply("ns", "a", "one", &finalizer_patch(&["x/one"])).await.unwrap();
        let _: Thing = cluster.apply("ns", "a", "two", &finalizer_patch(&["x/two"])).await.unwrap();
        let _: Thing = cluster.apply("ns", "a", "one", &finalizer_patch(&[])).await.unwrap();

        let a = cluster.object::<Thing>("ns", "a").unwrap();
        assert_eq!(a.finalizers(), &["x/two".to_string()]);
    }

    #[tokio::test]
    async fn deleting_waits_for_the_last_finalizer() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", None)).unwrap();
        let _: Thing = cluster.apply("ns", "a", "one", &finalizer_patch(&["x/one"])).await.unwrap();

        cluster.delete::<Thing>("ns", "a").unwrap();
        let a = cluster.object::<Thing>("ns", "a").unwrap();
        assert!(a.metadata.deletion_timestamp.is_some());

        let err = cluster
            .apply::<Thing>("ns", "a", "two", &finalizer_patch(&["x/two"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no new finalizers"));

        let _: Thing = cluster.apply("ns", "a", "one", &finalizer_patch(&[])).await.unwrap();
        assert!(!cluster.exists::<Thing>("ns", "a"));
    }

    #[tokio::test]
    async fn status_fields_are_dropped_when_no_longer_applied() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", None)).unwrap();
        let patch = json!({"status": {"id": "1", "resource": {"name": "n", "state": "ACTIVE"}}});
        let _: Thing = cluster.apply_status("ns", "a", "status", &patch).await.unwrap();
        let patch = json!({"status": {"id": "1"}});
        let a: Thing = cluster.apply_status("ns", "a", "status", &patch).await.unwrap();
        assert!(a.status.unwrap().resource.is_none());
    }

    #[tokio::test]
    async fn spec_updates_bump_the_generation() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", None)).unwrap();
        let a = cluster
            .update::<Thing>("ns", "a", |t| {
                if let Some(resource) = t.spec.resource.as_mut() {
                    resource.description = Some("changed".into());
                }
            })
            .unwrap();
        assert_eq!(a.metadata.generation, Some(2));
        let a = cluster.update::<Thing>("ns", "a", |_| {}).unwrap();
        assert_eq!(a.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn injected_failures_reject_one_write() {
        let cluster = FakeCluster::default();
        cluster.create(thing("a", None)).unwrap();
        cluster.fail_next_write("conflict");
        let patch = json!({"status": {"id": "1"}});
        assert!(cluster.merge_status::<Thing>("ns", "a", &patch).await.is_err());
        assert!(cluster.merge_status::<Thing>("ns", "a", &patch).await.is_ok());
        assert_eq!(cluster.patches_of(PatchKind::MergeStatus).len(), 1);
    }
}
