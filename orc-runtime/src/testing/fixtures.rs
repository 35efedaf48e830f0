//! A toy resource kind exercising the engine end to end
//!
//! `Thing` has a name, a mutable description and an optional parent `Thing`, stored in a
//! [`FakeCloud`].
use crate::{
    actuator::{self, Actuator, CreateError, ResourceController, ResourceStream},
    cluster::Cluster,
    dependency::Dependency,
    scope::{ScopeError, ScopeFactory},
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{api::ObjectMeta, CustomResource};
use orc_core::{
    CloudCredentialsRef, CloudError, ConditionReason, ImportFilter, ManagedObject, ManagedOptions,
    ManagedStatus, ManagementPolicy, ReconcileStatus, ResourceImport,
};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "test.k-orc.cloud", version = "v1alpha1", kind = "Thing", namespaced)]
#[kube(status = "ThingStatus")]
#[serde(rename_all = "camelCase")]
pub struct ThingSpec {
    #[serde(default)]
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ThingResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<ThingFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThingResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThingFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ImportFilter for ThingFilter {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThingResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub state: String,
}

pub type ThingStatus = ManagedStatus<ThingResourceStatus>;

orc_core::managed_object!(
    Thing,
    spec = ThingResourceSpec,
    filter = ThingFilter,
    status = ThingResourceStatus,
);

/// A managed `Thing` in namespace `ns`, optionally under `parent`
pub fn thing(name: &str, parent: Option<&str>) -> Thing {
    let mut thing = Thing::new(name, ThingSpec {
        cloud_credentials_ref: credentials(),
        resource: Some(ThingResourceSpec {
            parent_ref: parent.map(str::to_string),
            ..ThingResourceSpec::default()
        }),
        ..ThingSpec::default()
    });
    thing.metadata.namespace = Some("ns".into());
    thing
}

/// An unmanaged `Thing` importing the cloud thing named `filter_name`
pub fn imported_thing(name: &str, filter_name: &str) -> Thing {
    let mut thing = Thing::new(name, ThingSpec {
        cloud_credentials_ref: credentials(),
        management_policy: ManagementPolicy::Unmanaged,
        import: Some(ResourceImport {
            id: None,
            filter: Some(ThingFilter {
                name: Some(filter_name.into()),
                description: None,
            }),
        }),
        ..ThingSpec::default()
    });
    thing.metadata.namespace = Some("ns".into());
    thing
}

/// An unmanaged `Thing` importing the cloud thing with ID `id`
pub fn thing_imported_by_id(name: &str, id: &str) -> Thing {
    let mut thing = Thing::new(name, ThingSpec {
        cloud_credentials_ref: credentials(),
        management_policy: ManagementPolicy::Unmanaged,
        import: Some(ResourceImport {
            id: Some(id.into()),
            filter: None,
        }),
        ..ThingSpec::default()
    });
    thing.metadata.namespace = Some("ns".into());
    thing
}

fn credentials() -> CloudCredentialsRef {
    CloudCredentialsRef {
        secret_name: "creds".into(),
        cloud_name: "openstack".into(),
    }
}

/// Give `thing` an ID and an `Available` condition, as its controller would
pub fn mark_available(thing: &mut Thing, id: &str) {
    let now = "1970-01-01T00:00:00Z".to_string();
    thing.status = Some(ThingStatus {
        id: Some(id.into()),
        resource: None,
        conditions: vec![orc_core::Condition {
            type_: orc_core::conditions::AVAILABLE.into(),
            status: orc_core::ConditionStatus::True,
            observed_generation: thing.metadata.generation,
            last_transition_time: now,
            reason: ConditionReason::Success.as_str().into(),
            message: "OpenStack resource is available".into(),
        }],
    });
}

/// A credentials secret in namespace `ns` defining `cloud`
pub fn secret(name: &str, cloud: &str) -> Secret {
    let clouds = format!("clouds:\n  {cloud}:\n    auth:\n      auth_url: https://keystone.example\n");
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([("clouds.yaml".to_string(), ByteString(clouds.into_bytes()))])),
        ..Secret::default()
    }
}

/// A thing as stored in the cloud
#[derive(Clone, Debug, PartialEq)]
pub struct CloudThing {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub state: String,
}

/// An active cloud thing named `name`, without an ID until inserted
pub fn cloud_thing(name: &str) -> CloudThing {
    CloudThing {
        id: String::new(),
        name: name.into(),
        description: None,
        parent_id: None,
        state: "ACTIVE".into(),
    }
}

#[derive(Default)]
struct CloudState {
    things: BTreeMap<String, CloudThing>,
    next_id: u64,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, CloudError>,
    panics: HashSet<&'static str>,
    lose_updates: bool,
}

/// An in-memory cloud holding [`CloudThing`]s
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    /// Store `thing`, assigning it an ID; returns the ID
    pub fn insert(&self, mut thing: CloudThing) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        thing.id = format!("thing-{}", state.next_id);
        let id = thing.id.clone();
        state.things.insert(id.clone(), thing);
        id
    }

    pub fn get(&self, id: &str) -> Option<CloudThing> {
        self.state.lock().things.get(id).cloned()
    }

    /// Move a thing to another state behind the controller's back
    pub fn set_state(&self, id: &str, state: &str) {
        if let Some(thing) = self.state.lock().things.get_mut(id) {
            thing.state = state.into();
        }
    }

    /// Delete a thing behind the controller's back
    pub fn remove(&self, id: &str) {
        self.state.lock().things.remove(id);
    }

    /// How many times `op` was called
    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or_default()
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: &'static str, err: CloudError) {
        self.state.lock().failures.insert(op, err);
    }

    /// Accept updates without applying them, so the resource never converges
    pub fn lose_updates(&self) {
        self.state.lock().lose_updates = true;
    }

    /// Panic on every call of `op`
    pub fn panic_on(&self, op: &'static str) {
        self.state.lock().panics.insert(op);
    }

    fn call(&self, op: &'static str) -> Result<(), CloudError> {
        let panics = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            if let Some(err) = state.failures.remove(op) {
                return Err(err);
            }
            state.panics.contains(op)
        };
        if panics {
            panic!("{op} exploded");
        }
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<CloudThing, CloudError> {
        self.get(id).ok_or_else(|| CloudError::not_found(format!("thing {id}")))
    }

    fn list(&self, keep: impl Fn(&CloudThing) -> bool) -> ResourceStream<CloudThing> {
        let things = self
            .state
            .lock()
            .things
            .values()
            .filter(|t| keep(t))
            .cloned()
            .map(Ok)
            .collect::<Vec<_>>();
        stream::iter(things).boxed()
    }
}

/// The parent reference of a `Thing`
pub fn parent_dependency() -> Dependency<Thing, Thing> {
    Dependency::guarded(ThingController::NAME, "spec.resource.parentRef", |t: &Thing| {
        t.spec.resource.iter().filter_map(|r| r.parent_ref.clone()).collect()
    })
}

#[derive(Clone, Copy, Debug)]
pub enum ThingStep {
    UpdateDescription,
}

pub struct ThingActuator<C> {
    cloud: FakeCloud,
    cluster: C,
    parent: Dependency<Thing, Thing>,
}

impl<C: Cluster> ThingActuator<C> {
    /// The OpenStack ID of the parent, or the reason it is not usable yet
    async fn parent_id(&self, obj: &Thing) -> Result<Option<String>, ReconcileStatus> {
        Ok(self
            .parent
            .fetch_one(&self.cluster, obj)
            .await?
            .and_then(|parent| parent.status_id().map(str::to_string)))
    }
}

#[async_trait]
impl<C: Cluster> Actuator for ThingActuator<C> {
    type Object = Thing;
    type OsResource = CloudThing;
    type Step = ThingStep;

    fn resource_id(&self, resource: &CloudThing) -> String {
        resource.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<CloudThing, CloudError> {
        self.cloud.call("get")?;
        self.cloud.lookup(id)
    }

    async fn list_for_adoption(&self, obj: &Thing) -> Result<Option<ResourceStream<CloudThing>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        let parent_id = self.parent_id(obj).await?;
        let name = obj.resource_name(resource.name.as_deref());
        self.cloud.call("list").map_err(ReconcileStatus::from)?;
        Ok(Some(
            self.cloud.list(move |t| t.name == name && t.parent_id == parent_id),
        ))
    }

    async fn list_for_import(
        &self,
        _obj: &Thing,
        filter: &ThingFilter,
    ) -> Result<ResourceStream<CloudThing>, ReconcileStatus> {
        self.cloud.call("list").map_err(ReconcileStatus::from)?;
        let filter = filter.clone();
        Ok(self.cloud.list(move |t| {
            filter.name.as_ref().is_none_or(|name| *name == t.name)
                && filter.description.as_ref().is_none_or(|d| Some(d) == t.description.as_ref())
        }))
    }

    async fn create(&self, obj: &Thing) -> Result<CloudThing, CreateError> {
        let Some(resource) = obj.resource_spec() else {
            return Err(ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, "no resource").into());
        };
        let parent_id = self.parent_id(obj).await?;
        self.cloud.call("create")?;
        let id = self.cloud.insert(CloudThing {
            id: String::new(),
            name: obj.resource_name(resource.name.as_deref()),
            description: resource.description.clone(),
            parent_id,
            state: "ACTIVE".into(),
        });
        Ok(self.cloud.lookup(&id)?)
    }

    async fn delete(&self, _obj: &Thing, resource: &CloudThing) -> Result<ReconcileStatus, CloudError> {
        self.cloud.call("delete")?;
        self.cloud.lookup(&resource.id)?;
        self.cloud.remove(&resource.id);
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &Thing, _resource: &CloudThing) -> Vec<ThingStep> {
        vec![ThingStep::UpdateDescription]
    }

    async fn run_step(&self, step: ThingStep, obj: &Thing, resource: &CloudThing) -> ReconcileStatus {
        match step {
            ThingStep::UpdateDescription => {
                let wanted = obj.resource_spec().and_then(|r| r.description.clone());
                if wanted == resource.description {
                    return ReconcileStatus::ok();
                }
                if let Err(err) = self.cloud.call("update") {
                    return err.into();
                }
                let mut state = self.cloud.state.lock();
                if !state.lose_updates {
                    if let Some(thing) = state.things.get_mut(&resource.id) {
                        thing.description = wanted;
                    }
                }
                drop(state);
                actuator::updated()
            }
        }
    }

    fn is_available(&self, _obj: &Thing, resource: &CloudThing) -> bool {
        resource.state == "ACTIVE"
    }

    fn resource_status(&self, resource: &CloudThing) -> ThingResourceStatus {
        ThingResourceStatus {
            name: resource.name.clone(),
            description: resource.description.clone(),
            parent_id: resource.parent_id.clone(),
            state: resource.state.clone(),
        }
    }
}

pub struct ThingController;

impl ResourceController for ThingController {
    type Actuator<C: Cluster> = ThingActuator<C>;
    type Object = Thing;
    type Scope = FakeCloud;

    const NAME: &'static str = "thing";

    fn actuator<C: Cluster>(&self, scope: &FakeCloud, cluster: &C) -> ThingActuator<C> {
        ThingActuator {
            cloud: scope.clone(),
            cluster: cluster.clone(),
            parent: parent_dependency(),
        }
    }
}

/// Hands out one shared [`FakeCloud`] for any secret defining the requested cloud
#[derive(Clone, Default)]
pub struct FakeScopes {
    cloud: FakeCloud,
}

impl FakeScopes {
    pub fn new(cloud: FakeCloud) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl ScopeFactory for FakeScopes {
    type Scope = FakeCloud;

    async fn new_scope(
        &self,
        credentials: &Secret,
        cloud_name: &str,
        _cancel: CancellationToken,
    ) -> Result<FakeCloud, ScopeError> {
        let raw = credentials
            .data
            .as_ref()
            .and_then(|data| data.get("clouds.yaml"))
            .ok_or_else(|| ScopeError::MissingKey("clouds.yaml".into()))?;
        let clouds: serde_yaml::Value =
            serde_yaml::from_slice(&raw.0).map_err(|err| ScopeError::Malformed(err.to_string()))?;
        if clouds["clouds"][cloud_name].is_null() {
            return Err(ScopeError::UnknownCloud(cloud_name.into()));
        }
        Ok(self.cloud.clone())
    }
}
