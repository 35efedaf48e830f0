//! Neutron networks
use crate::{
    osclients::{self as os, Clients, NetworkClient, NetworkCreate, NetworkList, NetworkUpdate},
    tags,
};
use async_trait::async_trait;
use kube::CustomResource;
use orc_core::{
    CloudCredentialsRef, CloudError, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus,
    ManagementPolicy, ReconcileStatus, ResourceImport,
};
use orc_runtime::{actuator, Actuator, Cluster, CreateError, ResourceController, ResourceStream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A Neutron network
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "Network", namespaced)]
#[kube(status = "NetworkStatus", shortname = "osnet")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type=='Available')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<NetworkResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<NetworkFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResourceSpec {
    /// Defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_state_up: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    /// Set at creation only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    /// Networks carrying all of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for NetworkFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub admin_state_up: bool,
    pub mtu: i32,
    pub shared: bool,
    pub external: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type NetworkStatus = ManagedStatus<NetworkResourceStatus>;

orc_core::managed_object!(
    Network,
    spec = NetworkResourceSpec,
    filter = NetworkFilter,
    status = NetworkResourceStatus,
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStep {
    Update,
    Tags,
}

pub struct NetworkActuator {
    client: Arc<dyn NetworkClient>,
}

/// The changes needed to bring `network` in line with `spec`
fn update_for(name: String, spec: &NetworkResourceSpec, network: &os::Network) -> NetworkUpdate {
    NetworkUpdate {
        name: (name != network.name).then_some(name),
        description: spec.description.clone().filter(|d| *d != network.description),
        admin_state_up: spec.admin_state_up.filter(|up| *up != network.admin_state_up),
        mtu: spec.mtu.filter(|mtu| *mtu != network.mtu),
        shared: spec.shared.filter(|shared| *shared != network.shared),
    }
}

#[async_trait]
impl Actuator for NetworkActuator {
    type Object = Network;
    type OsResource = os::Network;
    type Step = NetworkStep;

    fn resource_id(&self, network: &Self::OsResource) -> String {
        network.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<Self::OsResource, CloudError> {
        self.client.get_network(id).await
    }

    async fn list_for_adoption(
        &self,
        obj: &Network,
    ) -> Result<Option<ResourceStream<Self::OsResource>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        Ok(Some(self.client.list_networks(&NetworkList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            ..NetworkList::default()
        })))
    }

    async fn list_for_import(
        &self,
        _obj: &Network,
        filter: &NetworkFilter,
    ) -> Result<ResourceStream<Self::OsResource>, ReconcileStatus> {
        Ok(self.client.list_networks(&NetworkList {
            name: filter.name.clone(),
            description: filter.description.clone(),
            external: filter.external,
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &Network) -> Result<Self::OsResource, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let opts = NetworkCreate {
            name: obj.resource_name(resource.name.as_deref()),
            description: resource.description.clone().unwrap_or_default(),
            admin_state_up: resource.admin_state_up,
            mtu: resource.mtu,
            shared: resource.shared,
            external: resource.external,
        };
        Ok(self.client.create_network(&opts).await?)
    }

    async fn delete(&self, _obj: &Network, network: &Self::OsResource) -> Result<ReconcileStatus, CloudError> {
        self.client.delete_network(&network.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &Network, _network: &Self::OsResource) -> Vec<NetworkStep> {
        vec![NetworkStep::Update, NetworkStep::Tags]
    }

    async fn run_step(&self, step: NetworkStep, obj: &Network, network: &Self::OsResource) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            NetworkStep::Update => {
                let update = update_for(obj.resource_name(resource.name.as_deref()), resource, network);
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                debug!(?update, "updating network");
                match self.client.update_network(&network.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
            NetworkStep::Tags => {
                tags::sync_neutron(self.client.as_ref(), "networks", &network.id, &resource.tags, &network.tags).await
            }
        }
    }

    fn resource_status(&self, network: &Self::OsResource) -> NetworkResourceStatus {
        NetworkResourceStatus {
            name: network.name.clone(),
            description: network.description.clone(),
            admin_state_up: network.admin_state_up,
            mtu: network.mtu,
            shared: network.shared,
            external: network.external,
            status: network.status.clone(),
            tags: tags::normalize(&network.tags),
        }
    }

    fn is_available(&self, _obj: &Network, network: &Self::OsResource) -> bool {
        network.status == "ACTIVE"
    }
}

pub struct NetworkController;

impl ResourceController for NetworkController {
    type Actuator<C: Cluster> = NetworkActuator;
    type Object = Network;
    type Scope = Clients;

    const NAME: &'static str = "network";

    fn actuator<C: Cluster>(&self, clients: &Clients, _cluster: &C) -> NetworkActuator {
        NetworkActuator {
            client: clients.networking.clone(),
        }
    }
}
