//! Octavia load balancers
//!
//! Octavia moves a load balancer through `PENDING_CREATE`, `PENDING_UPDATE` and
//! `PENDING_DELETE` while it works on it, and refuses any change in the meantime. The controller
//! waits these states out; only an `ACTIVE` load balancer is available.
use crate::{
    osclients::{self as os, Clients, LoadBalancerClient, LoadBalancerCreate, LoadBalancerList, LoadBalancerUpdate},
    subnet::Subnet,
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

pub const ACTIVE: &str = "ACTIVE";
const ERROR: &str = "ERROR";

/// Whether Octavia is still working on a resource in provisioning state `status`
pub fn is_pending(status: &str) -> bool {
    status.starts_with("PENDING_")
}

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "LoadBalancer", namespaced)]
#[kube(status = "LoadBalancerStatus", shortname = "oslb")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(
    printcolumn = r#"{"name":"Provisioning","type":"string","jsonPath":".status.resource.provisioningStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<LoadBalancerResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<LoadBalancerFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the `Subnet` to allocate the VIP from
    pub vip_subnet_ref: String,
    /// Immutable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for LoadBalancerFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "vipSubnetID")]
    pub vip_subnet_id: String,
    pub vip_address: String,
    pub provisioning_status: String,
    pub operating_status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type LoadBalancerStatus = ManagedStatus<LoadBalancerResourceStatus>;

orc_core::managed_object!(
    LoadBalancer,
    spec = LoadBalancerResourceSpec,
    filter = LoadBalancerFilter,
    status = LoadBalancerResourceStatus,
);

/// `spec.resource.vipSubnetRef`
pub fn vip_subnet_dependency() -> Dependency<LoadBalancer, Subnet> {
    Dependency::guarded(
        LoadBalancerController::NAME,
        "spec.resource.vipSubnetRef",
        |lb: &LoadBalancer| lb.spec.resource.iter().map(|r| r.vip_subnet_ref.clone()).collect(),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadBalancerStep {
    Provisioning,
    Immutable,
    Update,
}

pub struct LoadBalancerActuator<C> {
    client: Arc<dyn LoadBalancerClient>,
    cluster: C,
    vip_subnet: Dependency<LoadBalancer, Subnet>,
}

fn update_for(name: String, spec: &LoadBalancerResourceSpec, lb: &os::LoadBalancer) -> LoadBalancerUpdate {
    LoadBalancerUpdate {
        name: (name != lb.name).then_some(name),
        description: spec.description.clone().filter(|d| *d != lb.description),
        tags: (!tags::in_sync(&spec.tags, &lb.tags)).then(|| tags::normalize(&spec.tags)),
    }
}

#[async_trait]
impl<C: Cluster> Actuator for LoadBalancerActuator<C> {
    type Object = LoadBalancer;
    type OsResource = os::LoadBalancer;
    type Step = LoadBalancerStep;

    fn resource_id(&self, lb: &os::LoadBalancer) -> String {
        lb.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::LoadBalancer, CloudError> {
        self.client.get_load_balancer(id).await
    }

    async fn list_for_adoption(
        &self,
        obj: &LoadBalancer,
    ) -> Result<Option<ResourceStream<os::LoadBalancer>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        Ok(Some(self.client.list_load_balancers(&LoadBalancerList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            ..LoadBalancerList::default()
        })))
    }

    async fn list_for_import(
        &self,
        _obj: &LoadBalancer,
        filter: &LoadBalancerFilter,
    ) -> Result<ResourceStream<os::LoadBalancer>, ReconcileStatus> {
        Ok(self.client.list_load_balancers(&LoadBalancerList {
            name: filter.name.clone(),
            description: filter.description.clone(),
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &LoadBalancer) -> Result<os::LoadBalancer, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let vip_subnet_id = crate::required_id(&self.vip_subnet, &self.cluster, obj).await?;
        let opts = LoadBalancerCreate {
            name: obj.resource_name(resource.name.as_deref()),
            description: resource.description.clone().unwrap_or_default(),
            vip_subnet_id,
            vip_address: resource.vip_address.clone(),
            tags: tags::normalize(&resource.tags),
        };
        Ok(self.client.create_load_balancer(&opts).await?)
    }

    async fn delete(&self, _obj: &LoadBalancer, lb: &os::LoadBalancer) -> Result<ReconcileStatus, CloudError> {
        if is_pending(&lb.provisioning_status) {
            debug!(status = %lb.provisioning_status, "load balancer is busy, not deleting yet");
            return Ok(actuator::wait_for(Phase::Delete));
        }
        self.client.delete_load_balancer(&lb.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &LoadBalancer, _lb: &os::LoadBalancer) -> Vec<LoadBalancerStep> {
        vec![
            LoadBalancerStep::Provisioning,
            LoadBalancerStep::Immutable,
            LoadBalancerStep::Update,
        ]
    }

    async fn run_step(&self, step: LoadBalancerStep, obj: &LoadBalancer, lb: &os::LoadBalancer) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            LoadBalancerStep::Provisioning if is_pending(&lb.provisioning_status) => actuator::wait_for(Phase::Ready),
            LoadBalancerStep::Provisioning if lb.provisioning_status == ERROR => ReconcileStatus::terminal(
                ConditionReason::UnrecoverableError,
                "load balancer is in ERROR state",
            ),
            LoadBalancerStep::Provisioning => ReconcileStatus::ok(),
            LoadBalancerStep::Immutable => match &resource.vip_address {
                Some(address) if *address != lb.vip_address => actuator::immutable("VIPAddress"),
                _ => ReconcileStatus::ok(),
            },
            LoadBalancerStep::Update => {
                let update = update_for(obj.resource_name(resource.name.as_deref()), resource, lb);
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                debug!(?update, "updating load balancer");
                match self.client.update_load_balancer(&lb.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) if err.is_conflict() => actuator::wait_for(Phase::Update),
                    Err(err) => actuator::update_error(err),
                }
            }
        }
    }

    fn resource_status(&self, lb: &os::LoadBalancer) -> LoadBalancerResourceStatus {
        LoadBalancerResourceStatus {
            name: lb.name.clone(),
            description: lb.description.clone(),
            vip_subnet_id: lb.vip_subnet_id.clone(),
            vip_address: lb.vip_address.clone(),
            provisioning_status: lb.provisioning_status.clone(),
            operating_status: lb.operating_status.clone(),
            tags: tags::normalize(&lb.tags),
        }
    }

    fn is_available(&self, _obj: &LoadBalancer, lb: &os::LoadBalancer) -> bool {
        lb.provisioning_status == ACTIVE
    }
}

pub struct LoadBalancerController;

impl ResourceController for LoadBalancerController {
    type Actuator<C: Cluster> = LoadBalancerActuator<C>;
    type Object = LoadBalancer;
    type Scope = Clients;

    const NAME: &'static str = "loadbalancer";

    fn actuator<C: Cluster>(&self, clients: &Clients, cluster: &C) -> LoadBalancerActuator<C> {
        LoadBalancerActuator {
            client: clients.load_balancer.clone(),
            cluster: cluster.clone(),
            vip_subnet: vip_subnet_dependency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::{progress::EXTERNAL_UPDATE_POLLING_PERIOD, Severity};
    use orc_runtime::testing::FakeCluster;

    fn lb(status: &str) -> os::LoadBalancer {
        os::LoadBalancer {
            id: "loadbalancer-0001".into(),
            name: "lb".into(),
            provisioning_status: status.into(),
            ..os::LoadBalancer::default()
        }
    }

    fn object() -> LoadBalancer {
        let mut obj = LoadBalancer::new("lb", LoadBalancerSpec {
            resource: Some(LoadBalancerResourceSpec {
                vip_subnet_ref: "s1".into(),
                ..LoadBalancerResourceSpec::default()
            }),
            ..LoadBalancerSpec::default()
        });
        obj.metadata.namespace = Some("ns".into());
        obj
    }

    #[tokio::test]
    async fn provisioning_states_are_waited_out() {
        let cloud = os::mock::MockCloud::new();
        let actuator = LoadBalancerController.actuator(&Clients::from_cloud(cloud.clone()), &FakeCluster::default());

        for pending in ["PENDING_CREATE", "PENDING_UPDATE"] {
            let status = actuator.run_step(LoadBalancerStep::Provisioning, &object(), &lb(pending)).await;
            assert_eq!(status.severity(), Severity::Waiting);
            assert_eq!(status.requeue(), EXTERNAL_UPDATE_POLLING_PERIOD);
        }
        let status = actuator.run_step(LoadBalancerStep::Provisioning, &object(), &lb("ERROR")).await;
        assert_eq!(status.severity(), Severity::Terminal);
        assert!(actuator.run_step(LoadBalancerStep::Provisioning, &object(), &lb(ACTIVE)).await.is_ok());

        let status = actuator.delete(&object(), &lb("PENDING_UPDATE")).await.unwrap();
        assert_eq!(status.messages(), vec!["Waiting for OpenStack resource to be deleted"]);
        assert_eq!(cloud.calls("delete_load_balancer"), 0);
    }

    #[test]
    fn tags_are_updated_with_the_rest() {
        let mut spec = object().spec.resource.unwrap();
        spec.tags = vec!["b".into(), "a".into()];
        let update = update_for("lb".into(), &spec, &lb(ACTIVE));
        assert_eq!(update, LoadBalancerUpdate {
            tags: Some(vec!["a".into(), "b".into()]),
            ..LoadBalancerUpdate::default()
        });
    }
}
