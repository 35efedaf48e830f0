//! Octavia pools
//!
//! Every change to a pool is also a change to its load balancer, which Octavia refuses with a 409
//! while the load balancer is not `ACTIVE`. Those conflicts are waited out rather than reported
//! as configuration errors.
use crate::{
    loadbalancer::{is_pending, LoadBalancer, ACTIVE},
    osclients::{self as os, Clients, LoadBalancerClient, PoolCreate, PoolList, PoolUpdate},
    tags,
};
use async_trait::async_trait;
use kube::CustomResource;
use orc_core::{
    CloudCredentialsRef, CloudError, ConditionReason, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus,
    ManagementPolicy, Phase, ReconcileStatus, ResourceImport,
};
use orc_runtime::{actuator, Actuator, Cluster, CreateError, Dependency, ResourceController, ResourceStream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "LBPool", namespaced)]
#[kube(status = "LBPoolStatus", shortname = "oslbpool")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(
    printcolumn = r#"{"name":"Provisioning","type":"string","jsonPath":".status.resource.provisioningStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LBPoolSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<LBPoolResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<LBPoolFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LBPoolResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the `LoadBalancer` the pool belongs to
    pub load_balancer_ref: String,
    /// e.g. `HTTP` or `TCP`; immutable
    pub protocol: String,
    /// e.g. `ROUND_ROBIN`
    pub lb_algorithm: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LBPoolFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for LBPoolFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LBPoolResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "loadBalancerID")]
    pub load_balancer_id: String,
    pub protocol: String,
    pub lb_algorithm: String,
    pub provisioning_status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type LBPoolStatus = ManagedStatus<LBPoolResourceStatus>;

orc_core::managed_object!(
    LBPool,
    spec = LBPoolResourceSpec,
    filter = LBPoolFilter,
    status = LBPoolResourceStatus,
);

/// `spec.resource.loadBalancerRef`
pub fn load_balancer_dependency() -> Dependency<LBPool, LoadBalancer> {
    Dependency::guarded(LBPoolController::NAME, "spec.resource.loadBalancerRef", |pool: &LBPool| {
        pool.spec.resource.iter().map(|r| r.load_balancer_ref.clone()).collect()
    })
}

/// `spec.import.filter.loadBalancerRef`
pub fn import_load_balancer_dependency() -> Dependency<LBPool, LoadBalancer> {
    Dependency::new("spec.import.filter.loadBalancerRef", |pool: &LBPool| {
        pool.import_filter()
            .and_then(|filter| filter.load_balancer_ref.clone())
            .into_iter()
            .collect()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LBPoolStep {
    Provisioning,
    Immutable,
    Update,
}

pub struct LBPoolActuator<C> {
    client: Arc<dyn LoadBalancerClient>,
    cluster: C,
    load_balancer: Dependency<LBPool, LoadBalancer>,
    import_load_balancer: Dependency<LBPool, LoadBalancer>,
}

/// The load balancer is busy; come back once it is `ACTIVE` again
fn load_balancer_busy() -> ReconcileStatus {
    actuator::wait_for(Phase::Ready)
}

fn update_for(name: String, spec: &LBPoolResourceSpec, pool: &os::Pool) -> PoolUpdate {
    PoolUpdate {
        name: (name != pool.name).then_some(name),
        description: spec.description.clone().filter(|d| *d != pool.description),
        lb_algorithm: (spec.lb_algorithm != pool.lb_algorithm).then(|| spec.lb_algorithm.clone()),
        tags: (!tags::in_sync(&spec.tags, &pool.tags)).then(|| tags::normalize(&spec.tags)),
    }
}

#[async_trait]
impl<C: Cluster> Actuator for LBPoolActuator<C> {
    type Object = LBPool;
    type OsResource = os::Pool;
    type Step = LBPoolStep;

    fn resource_id(&self, pool: &os::Pool) -> String {
        pool.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::Pool, CloudError> {
        self.client.get_pool(id).await
    }

    async fn list_for_adoption(&self, obj: &LBPool) -> Result<Option<ResourceStream<os::Pool>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        let loadbalancer_id = crate::required_id(&self.load_balancer, &self.cluster, obj).await?;
        Ok(Some(self.client.list_pools(&PoolList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            loadbalancer_id: Some(loadbalancer_id),
            ..PoolList::default()
        })))
    }

    async fn list_for_import(
        &self,
        obj: &LBPool,
        filter: &LBPoolFilter,
    ) -> Result<ResourceStream<os::Pool>, ReconcileStatus> {
        let loadbalancer_id = crate::dependency_id(&self.import_load_balancer, &self.cluster, obj).await?;
        Ok(self.client.list_pools(&PoolList {
            name: filter.name.clone(),
            loadbalancer_id,
            protocol: filter.protocol.clone(),
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &LBPool) -> Result<os::Pool, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let loadbalancer_id = crate::required_id(&self.load_balancer, &self.cluster, obj).await?;
        let opts = PoolCreate {
            name: obj.resource_name(resource.name.as_deref()),
            description: resource.description.clone().unwrap_or_default(),
            loadbalancer_id,
            protocol: resource.protocol.clone(),
            lb_algorithm: resource.lb_algorithm.clone(),
            tags: tags::normalize(&resource.tags),
        };
        Ok(self.client.create_pool(&opts).await?)
    }

    async fn delete(&self, _obj: &LBPool, pool: &os::Pool) -> Result<ReconcileStatus, CloudError> {
        if is_pending(&pool.provisioning_status) {
            return Ok(actuator::wait_for(Phase::Delete));
        }
        self.client.delete_pool(&pool.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &LBPool, _pool: &os::Pool) -> Vec<LBPoolStep> {
        vec![LBPoolStep::Provisioning, LBPoolStep::Immutable, LBPoolStep::Update]
    }

    async fn run_step(&self, step: LBPoolStep, obj: &LBPool, pool: &os::Pool) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            LBPoolStep::Provisioning if is_pending(&pool.provisioning_status) => actuator::wait_for(Phase::Ready),
            LBPoolStep::Provisioning if pool.provisioning_status == "ERROR" => {
                ReconcileStatus::terminal(ConditionReason::UnrecoverableError, "pool is in ERROR state")
            }
            LBPoolStep::Provisioning => ReconcileStatus::ok(),
            LBPoolStep::Immutable if resource.protocol != pool.protocol => actuator::immutable("Protocol"),
            LBPoolStep::Immutable => ReconcileStatus::ok(),
            LBPoolStep::Update => {
                let update = update_for(obj.resource_name(resource.name.as_deref()), resource, pool);
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                debug!(?update, "updating pool");
                match self.client.update_pool(&pool.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) if err.is_conflict() => load_balancer_busy(),
                    Err(err) => actuator::update_error(err),
                }
            }
        }
    }

    fn resource_status(&self, pool: &os::Pool) -> LBPoolResourceStatus {
        LBPoolResourceStatus {
            name: pool.name.clone(),
            description: pool.description.clone(),
            load_balancer_id: pool.loadbalancer_id.clone(),
            protocol: pool.protocol.clone(),
            lb_algorithm: pool.lb_algorithm.clone(),
            provisioning_status: pool.provisioning_status.clone(),
            tags: tags::normalize(&pool.tags),
        }
    }

    fn is_available(&self, _obj: &LBPool, pool: &os::Pool) -> bool {
        pool.provisioning_status == ACTIVE
    }

    fn on_create_error(&self, err: CloudError) -> ReconcileStatus {
        if err.is_conflict() {
            debug!(%err, "load balancer is busy, waiting to create pool");
            load_balancer_busy()
        } else if err.is_retryable() {
            ReconcileStatus::error(err)
        } else {
            ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, err.to_string())
        }
    }

    fn on_delete_error(&self, err: CloudError) -> ReconcileStatus {
        if err.is_not_found() {
            ReconcileStatus::ok()
        } else if err.is_conflict() {
            load_balancer_busy()
        } else {
            ReconcileStatus::error(err)
        }
    }
}

pub struct LBPoolController;

impl ResourceController for LBPoolController {
    type Actuator<C: Cluster> = LBPoolActuator<C>;
    type Object = LBPool;
    type Scope = Clients;

    const NAME: &'static str = "lbpool";

    fn actuator<C: Cluster>(&self, clients: &Clients, cluster: &C) -> LBPoolActuator<C> {
        LBPoolActuator {
            client: clients.load_balancer.clone(),
            cluster: cluster.clone(),
            load_balancer: load_balancer_dependency(),
            import_load_balancer: import_load_balancer_dependency(),
        }
    }
}
