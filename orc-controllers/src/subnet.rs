//! Neutron subnets
//!
//! A subnet names its network with `spec.resource.networkRef`. The reference is guarded: the
//! `Network` cannot be deleted while a `Subnet` names it. An import filter may also name a
//! network; that reference only narrows the search and is not guarded.
use crate::{
    network::Network,
    osclients::{self as os, Clients, NetworkClient, SubnetCreate, SubnetList, SubnetUpdate},
    tags,
};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
use orc_core::{
    CloudCredentialsRef, CloudError, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus,
    ManagementPolicy, ReconcileStatus, ResourceImport,
};
use orc_runtime::{actuator, Actuator, Cluster, CreateError, Dependency, ResourceController, ResourceStream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A Neutron subnet
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "Subnet", namespaced)]
#[kube(status = "SubnetStatus", shortname = "ossubnet")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".status.resource.cidr"}"#)]
#[kube(
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type=='Available')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<SubnetResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<SubnetFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the `Network` in the same namespace; immutable
    pub network_ref: String,
    /// Immutable
    pub cidr: String,
    /// 4 or 6; immutable
    pub ip_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_dhcp: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only subnets of this `Network`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for SubnetFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "networkID")]
    pub network_id: String,
    pub cidr: String,
    pub ip_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,
    pub enable_dhcp: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type SubnetStatus = ManagedStatus<SubnetResourceStatus>;

orc_core::managed_object!(
    Subnet,
    spec = SubnetResourceSpec,
    filter = SubnetFilter,
    status = SubnetResourceStatus,
);

/// `spec.resource.networkRef`
pub fn network_dependency() -> Dependency<Subnet, Network> {
    Dependency::guarded(SubnetController::NAME, "spec.resource.networkRef", |subnet: &Subnet| {
        subnet.spec.resource.iter().map(|r| r.network_ref.clone()).collect()
    })
}

/// `spec.import.filter.networkRef`
pub fn import_network_dependency() -> Dependency<Subnet, Network> {
    Dependency::new("spec.import.filter.networkRef", |subnet: &Subnet| {
        subnet
            .import_filter()
            .and_then(|filter| filter.network_ref.clone())
            .into_iter()
            .collect()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubnetStep {
    Immutable,
    Update,
    Tags,
}

pub struct SubnetActuator<C> {
    client: Arc<dyn NetworkClient>,
    cluster: C,
    network: Dependency<Subnet, Network>,
    import_network: Dependency<Subnet, Network>,
}

fn update_for(name: String, spec: &SubnetResourceSpec, subnet: &os::Subnet) -> SubnetUpdate {
    SubnetUpdate {
        name: (name != subnet.name).then_some(name),
        description: spec.description.clone().filter(|d| *d != subnet.description),
        enable_dhcp: spec.enable_dhcp.filter(|dhcp| *dhcp != subnet.enable_dhcp),
    }
}

impl<C: Cluster> SubnetActuator<C> {
    /// The immutable fields of `spec` which differ from `subnet`
    ///
    /// The network is compared through the `Network` object's recorded ID. A reference to a
    /// network object which is missing or has no ID is a different network.
    async fn immutable_changes(
        &self,
        obj: &Subnet,
        spec: &SubnetResourceSpec,
        subnet: &os::Subnet,
    ) -> Result<ReconcileStatus, orc_runtime::cluster::Error> {
        if spec.cidr != subnet.cidr {
            return Ok(actuator::immutable("CIDR"));
        }
        if spec.ip_version != subnet.ip_version {
            return Ok(actuator::immutable("IPVersion"));
        }
        let namespace = obj.namespace().unwrap_or_default();
        let network = self.cluster.get::<Network>(&namespace, &spec.network_ref).await?;
        if network.as_ref().and_then(|n| n.status_id()) != Some(subnet.network_id.as_str()) {
            return Ok(actuator::immutable("Network"));
        }
        Ok(ReconcileStatus::ok())
    }
}

#[async_trait]
impl<C: Cluster> Actuator for SubnetActuator<C> {
    type Object = Subnet;
    type OsResource = os::Subnet;
    type Step = SubnetStep;

    fn resource_id(&self, subnet: &os::Subnet) -> String {
        subnet.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::Subnet, CloudError> {
        self.client.get_subnet(id).await
    }

    async fn list_for_adoption(&self, obj: &Subnet) -> Result<Option<ResourceStream<os::Subnet>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        let network_id = crate::required_id(&self.network, &self.cluster, obj).await?;
        Ok(Some(self.client.list_subnets(&SubnetList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            network_id: Some(network_id),
            ..SubnetList::default()
        })))
    }

    async fn list_for_import(
        &self,
        obj: &Subnet,
        filter: &SubnetFilter,
    ) -> Result<ResourceStream<os::Subnet>, ReconcileStatus> {
        let network_id = crate::dependency_id(&self.import_network, &self.cluster, obj).await?;
        Ok(self.client.list_subnets(&SubnetList {
            name: filter.name.clone(),
            description: filter.description.clone(),
            network_id,
            cidr: filter.cidr.clone(),
            ip_version: filter.ip_version,
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &Subnet) -> Result<os::Subnet, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let network_id = crate::required_id(&self.network, &self.cluster, obj).await?;
        let opts = SubnetCreate {
            name: obj.resource_name(resource.name.as_deref()),
            description: resource.description.clone().unwrap_or_default(),
            network_id,
            cidr: resource.cidr.clone(),
            ip_version: resource.ip_version,
            gateway_ip: resource.gateway_ip.clone(),
            enable_dhcp: resource.enable_dhcp,
        };
        Ok(self.client.create_subnet(&opts).await?)
    }

    async fn delete(&self, _obj: &Subnet, subnet: &os::Subnet) -> Result<ReconcileStatus, CloudError> {
        self.client.delete_subnet(&subnet.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &Subnet, _subnet: &os::Subnet) -> Vec<SubnetStep> {
        vec![SubnetStep::Immutable, SubnetStep::Update, SubnetStep::Tags]
    }

    async fn run_step(&self, step: SubnetStep, obj: &Subnet, subnet: &os::Subnet) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            SubnetStep::Immutable => self
                .immutable_changes(obj, resource, subnet)
                .await
                .unwrap_or_else(|err| ReconcileStatus::error(orc_core::Error::retryable(err))),
            SubnetStep::Update => {
                let update = update_for(obj.resource_name(resource.name.as_deref()), resource, subnet);
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                debug!(?update, "updating subnet");
                match self.client.update_subnet(&subnet.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
            SubnetStep::Tags => {
                tags::sync_neutron(self.client.as_ref(), "subnets", &subnet.id, &resource.tags, &subnet.tags).await
            }
        }
    }

    fn resource_status(&self, subnet: &os::Subnet) -> SubnetResourceStatus {
        SubnetResourceStatus {
            name: subnet.name.clone(),
            description: subnet.description.clone(),
            network_id: subnet.network_id.clone(),
            cidr: subnet.cidr.clone(),
            ip_version: subnet.ip_version,
            gateway_ip: subnet.gateway_ip.clone(),
            enable_dhcp: subnet.enable_dhcp,
            tags: tags::normalize(&subnet.tags),
        }
    }
}

pub struct SubnetController;

impl ResourceController for SubnetController {
    type Actuator<C: Cluster> = SubnetActuator<C>;
    type Object = Subnet;
    type Scope = Clients;

    const NAME: &'static str = "subnet";

    fn actuator<C: Cluster>(&self, clients: &Clients, cluster: &C) -> SubnetActuator<C> {
        SubnetActuator {
            client: clients.networking.clone(),
            cluster: cluster.clone(),
            network: network_dependency(),
            import_network: import_network_dependency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::ConditionReason;
    use orc_runtime::testing::FakeCluster;

    fn subnet(network_ref: &str) -> Subnet {
        let mut subnet = Subnet::new("s1", SubnetSpec {
            resource: Some(SubnetResourceSpec {
                network_ref: network_ref.into(),
                cidr: "10.0.0.0/24".into(),
                ip_version: 4,
                ..SubnetResourceSpec::default()
            }),
            ..SubnetSpec::default()
        });
        subnet.metadata.namespace = Some("ns".into());
        subnet
    }

    fn actuator(cluster: &FakeCluster) -> SubnetActuator<FakeCluster> {
        SubnetController.actuator(&Clients::from_cloud(os::mock::MockCloud::new()), cluster)
    }

    fn observed() -> os::Subnet {
        os::Subnet {
            id: "subnet-0002".into(),
            name: "s1".into(),
            network_id: "network-0001".into(),
            cidr: "10.0.0.0/24".into(),
            ip_version: 4,
            enable_dhcp: true,
            ..os::Subnet::default()
        }
    }

    #[test]
    fn references_are_read_from_resource_and_filter() {
        assert_eq!(network_dependency().referenced(&subnet("n1")), vec!["n1"]);
        assert!(network_dependency().deletion_guard().is_some());

        let mut imported = subnet("n1");
        imported.spec.resource = None;
        imported.spec.import = Some(ResourceImport {
            id: None,
            filter: Some(SubnetFilter {
                network_ref: Some("n2".into()),
                ..SubnetFilter::default()
            }),
        });
        assert_eq!(import_network_dependency().referenced(&imported), vec!["n2"]);
        assert!(import_network_dependency().deletion_guard().is_none());
    }

    #[tokio::test]
    async fn cidr_changes_are_refused() {
        let cluster = FakeCluster::default();
        let mut obj = subnet("n1");
        if let Some(resource) = obj.spec.resource.as_mut() {
            resource.cidr = "10.1.0.0/24".into();
        }
        let status = actuator(&cluster)
            .run_step(SubnetStep::Immutable, &obj, &observed())
            .await;
        assert_eq!(
            status.terminal_error(),
            Some((ConditionReason::InvalidConfiguration, "CIDR is immutable".into()))
        );
    }

    #[tokio::test]
    async fn moving_to_another_network_is_refused() {
        let cluster = FakeCluster::default();
        cluster
            .create({
                let mut network = Network::new("n2", Default::default());
                network.metadata.namespace = Some("ns".into());
                network
            })
            .unwrap();
        let actuator = actuator(&cluster);

        let status = actuator.run_step(SubnetStep::Immutable, &subnet("n2"), &observed()).await;
        assert!(status.is_ok());

        cluster.set_available::<Network>("ns", "n2", "network-0009").unwrap();
        let status = actuator.run_step(SubnetStep::Immutable, &subnet("n2"), &observed()).await;
        assert_eq!(
            status.terminal_error().map(|(_, message)| message),
            Some("Network is immutable".into())
        );
    }
}
