//! Neutron floating IPs
use crate::{
    network::Network,
    osclients::{self as os, Clients, FloatingIpCreate, FloatingIpList, FloatingIpUpdate, NetworkClient},
    tags,
};
use async_trait::async_trait;
use kube::CustomResource;
use orc_core::{
    CloudCredentialsRef, CloudError, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus,
    ManagementPolicy, ReconcileStatus, ResourceImport,
};
use orc_runtime::{actuator, Actuator, Cluster, CreateError, Dependency, ResourceController, ResourceStream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A floating IP allocated from an external network
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "FloatingIP", namespaced)]
#[kube(status = "FloatingIPStatus", shortname = "osfip")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.resource.floatingIP"}"#)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIPSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<FloatingIPResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<FloatingIPFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIPResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the external `Network` to allocate from
    pub floating_network_ref: String,
    /// A specific address to allocate; immutable
    #[serde(default, rename = "floatingIP", skip_serializing_if = "Option::is_none")]
    pub floating_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIPFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating_network_ref: Option<String>,
    #[serde(default, rename = "floatingIP", skip_serializing_if = "Option::is_none")]
    pub floating_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for FloatingIPFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIPResourceStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "floatingNetworkID")]
    pub floating_network_id: String,
    #[serde(rename = "floatingIP")]
    pub floating_ip: String,
    #[serde(default, rename = "portID", skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type FloatingIPStatus = ManagedStatus<FloatingIPResourceStatus>;

orc_core::managed_object!(
    FloatingIP,
    spec = FloatingIPResourceSpec,
    filter = FloatingIPFilter,
    status = FloatingIPResourceStatus,
);

/// `spec.resource.floatingNetworkRef`
pub fn network_dependency() -> Dependency<FloatingIP, Network> {
    Dependency::guarded(
        FloatingIPController::NAME,
        "spec.resource.floatingNetworkRef",
        |fip: &FloatingIP| fip.spec.resource.iter().map(|r| r.floating_network_ref.clone()).collect(),
    )
}

/// `spec.import.filter.floatingNetworkRef`
pub fn import_network_dependency() -> Dependency<FloatingIP, Network> {
    Dependency::new("spec.import.filter.floatingNetworkRef", |fip: &FloatingIP| {
        fip.import_filter()
            .and_then(|filter| filter.floating_network_ref.clone())
            .into_iter()
            .collect()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatingIPStep {
    Immutable,
    Update,
    Tags,
}

pub struct FloatingIPActuator<C> {
    client: Arc<dyn NetworkClient>,
    cluster: C,
    network: Dependency<FloatingIP, Network>,
    import_network: Dependency<FloatingIP, Network>,
}

#[async_trait]
impl<C: Cluster> Actuator for FloatingIPActuator<C> {
    type Object = FloatingIP;
    type OsResource = os::FloatingIp;
    type Step = FloatingIPStep;

    fn resource_id(&self, fip: &os::FloatingIp) -> String {
        fip.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::FloatingIp, CloudError> {
        self.client.get_floating_ip(id).await
    }

    /// Floating IPs have no name: only an explicit address or description identifies one
    async fn list_for_adoption(
        &self,
        obj: &FloatingIP,
    ) -> Result<Option<ResourceStream<os::FloatingIp>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        if resource.floating_ip.is_none() && resource.description.is_none() {
            return Ok(None);
        }
        let network_id = crate::required_id(&self.network, &self.cluster, obj).await?;
        Ok(Some(self.client.list_floating_ips(&FloatingIpList {
            description: resource.description.clone(),
            floating_network_id: Some(network_id),
            floating_ip_address: resource.floating_ip.clone(),
            tags: Vec::new(),
        })))
    }

    async fn list_for_import(
        &self,
        obj: &FloatingIP,
        filter: &FloatingIPFilter,
    ) -> Result<ResourceStream<os::FloatingIp>, ReconcileStatus> {
        let floating_network_id = crate::dependency_id(&self.import_network, &self.cluster, obj).await?;
        Ok(self.client.list_floating_ips(&FloatingIpList {
            description: filter.description.clone(),
            floating_network_id,
            floating_ip_address: filter.floating_ip.clone(),
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &FloatingIP) -> Result<os::FloatingIp, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let floating_network_id = crate::required_id(&self.network, &self.cluster, obj).await?;
        let opts = FloatingIpCreate {
            description: resource.description.clone().unwrap_or_default(),
            floating_network_id,
            floating_ip_address: resource.floating_ip.clone(),
        };
        Ok(self.client.create_floating_ip(&opts).await?)
    }

    async fn delete(&self, _obj: &FloatingIP, fip: &os::FloatingIp) -> Result<ReconcileStatus, CloudError> {
        self.client.delete_floating_ip(&fip.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &FloatingIP, _fip: &os::FloatingIp) -> Vec<FloatingIPStep> {
        vec![FloatingIPStep::Immutable, FloatingIPStep::Update, FloatingIPStep::Tags]
    }

    async fn run_step(&self, step: FloatingIPStep, obj: &FloatingIP, fip: &os::FloatingIp) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            FloatingIPStep::Immutable => match &resource.floating_ip {
                Some(address) if *address != fip.floating_ip_address => actuator::immutable("FloatingIP"),
                _ => ReconcileStatus::ok(),
            },
            FloatingIPStep::Update => {
                let update = FloatingIpUpdate {
                    description: resource.description.clone().filter(|d| *d != fip.description),
                };
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                match self.client.update_floating_ip(&fip.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
            FloatingIPStep::Tags => {
                tags::sync_neutron(self.client.as_ref(), "floatingips", &fip.id, &resource.tags, &fip.tags).await
            }
        }
    }

    fn resource_status(&self, fip: &os::FloatingIp) -> FloatingIPResourceStatus {
        FloatingIPResourceStatus {
            description: fip.description.clone(),
            floating_network_id: fip.floating_network_id.clone(),
            floating_ip: fip.floating_ip_address.clone(),
            port_id: fip.port_id.clone(),
            status: fip.status.clone(),
            tags: tags::normalize(&fip.tags),
        }
    }
}

pub struct FloatingIPController;

impl ResourceController for FloatingIPController {
    type Actuator<C: Cluster> = FloatingIPActuator<C>;
    type Object = FloatingIP;
    type Scope = Clients;

    const NAME: &'static str = "floatingip";

    fn actuator<C: Cluster>(&self, clients: &Clients, cluster: &C) -> FloatingIPActuator<C> {
        FloatingIPActuator {
            client: clients.networking.clone(),
            cluster: cluster.clone(),
            network: network_dependency(),
            import_network: import_network_dependency(),
        }
    }
}
