//! Nova servers
use crate::{
    image::Image,
    osclients::{self as os, Clients, ComputeClient, ServerCreate, ServerList, ServerUpdate},
    tags,
};
use async_trait::async_trait;
use kube::{CustomResource, ResourceExt};
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
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "Server", namespaced)]
#[kube(status = "ServerStatus", shortname = "osserver")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.resource.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ServerResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<ServerFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name of the `Image` to boot from; immutable
    pub image_ref: String,
    /// Immutable
    pub flavor_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for ServerFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerResourceStatus {
    pub name: String,
    #[serde(rename = "imageID")]
    pub image_id: String,
    pub flavor_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type ServerStatus = ManagedStatus<ServerResourceStatus>;

orc_core::managed_object!(
    Server,
    spec = ServerResourceSpec,
    filter = ServerFilter,
    status = ServerResourceStatus,
);

/// `spec.resource.imageRef`
pub fn image_dependency() -> Dependency<Server, Image> {
    Dependency::guarded(ServerController::NAME, "spec.resource.imageRef", |server: &Server| {
        server.spec.resource.iter().map(|r| r.image_ref.clone()).collect()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStep {
    Immutable,
    Status,
    Update,
    Tags,
}

pub struct ServerActuator<C> {
    client: Arc<dyn ComputeClient>,
    cluster: C,
    image: Dependency<Server, Image>,
}

impl<C: Cluster> ServerActuator<C> {
    /// Compare the boot image and flavor with what the spec asks for
    ///
    /// The image is compared through the `Image` object's recorded ID. The server was created from
    /// an image with an ID, so a reference to an image object which is missing or has no ID is a
    /// different image.
    async fn immutable_changes(
        &self,
        obj: &Server,
        spec: &ServerResourceSpec,
        server: &os::Server,
    ) -> Result<ReconcileStatus, orc_runtime::cluster::Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let image = self.cluster.get::<Image>(&namespace, &spec.image_ref).await?;
        if image.as_ref().and_then(|i| i.status_id()) != Some(server.image_id.as_str()) {
            return Ok(actuator::immutable("Image"));
        }
        if spec.flavor_name != server.flavor_name {
            return Ok(actuator::immutable("Flavor"));
        }
        Ok(ReconcileStatus::ok())
    }
}

#[async_trait]
impl<C: Cluster> Actuator for ServerActuator<C> {
    type Object = Server;
    type OsResource = os::Server;
    type Step = ServerStep;

    fn resource_id(&self, server: &os::Server) -> String {
        server.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::Server, CloudError> {
        self.client.get_server(id).await
    }

    async fn list_for_adoption(&self, obj: &Server) -> Result<Option<ResourceStream<os::Server>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        Ok(Some(self.client.list_servers(&ServerList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            tags: Vec::new(),
        })))
    }

    async fn list_for_import(
        &self,
        _obj: &Server,
        filter: &ServerFilter,
    ) -> Result<ResourceStream<os::Server>, ReconcileStatus> {
        Ok(self.client.list_servers(&ServerList {
            name: filter.name.clone(),
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &Server) -> Result<os::Server, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let image_id = crate::required_id(&self.image, &self.cluster, obj).await?;
        let opts = ServerCreate {
            name: obj.resource_name(resource.name.as_deref()),
            image_id,
            flavor_name: resource.flavor_name.clone(),
            tags: tags::normalize(&resource.tags),
        };
        Ok(self.client.create_server(&opts).await?)
    }

    async fn delete(&self, _obj: &Server, server: &os::Server) -> Result<ReconcileStatus, CloudError> {
        self.client.delete_server(&server.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &Server, _server: &os::Server) -> Vec<ServerStep> {
        vec![ServerStep::Immutable, ServerStep::Status, ServerStep::Update, ServerStep::Tags]
    }

    async fn run_step(&self, step: ServerStep, obj: &Server, server: &os::Server) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            ServerStep::Immutable => self
                .immutable_changes(obj, resource, server)
                .await
                .unwrap_or_else(|err| ReconcileStatus::error(orc_core::Error::retryable(err))),
            ServerStep::Status => match server.status.as_str() {
                "BUILD" => actuator::wait_for(Phase::Ready),
                "ERROR" => ReconcileStatus::terminal(ConditionReason::UnrecoverableError, "server is in ERROR state"),
                _ => ReconcileStatus::ok(),
            },
            ServerStep::Update => {
                let name = obj.resource_name(resource.name.as_deref());
                if name == server.name {
                    return ReconcileStatus::ok();
                }
                debug!(%name, "renaming server");
                match self.client.update_server(&server.id, &ServerUpdate { name: Some(name) }).await {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
            ServerStep::Tags => {
                if tags::in_sync(&resource.tags, &server.tags) {
                    return ReconcileStatus::ok();
                }
                match self
                    .client
                    .replace_server_tags(&server.id, &tags::normalize(&resource.tags))
                    .await
                {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
        }
    }

    fn resource_status(&self, server: &os::Server) -> ServerResourceStatus {
        ServerResourceStatus {
            name: server.name.clone(),
            image_id: server.image_id.clone(),
            flavor_name: server.flavor_name.clone(),
            status: server.status.clone(),
            tags: tags::normalize(&server.tags),
        }
    }

    fn is_available(&self, _obj: &Server, server: &os::Server) -> bool {
        server.status == "ACTIVE"
    }
}

pub struct ServerController;

impl ResourceController for ServerController {
    type Actuator<C: Cluster> = ServerActuator<C>;
    type Object = Server;
    type Scope = Clients;

    const NAME: &'static str = "server";

    fn actuator<C: Cluster>(&self, clients: &Clients, cluster: &C) -> ServerActuator<C> {
        ServerActuator {
            client: clients.compute.clone(),
            cluster: cluster.clone(),
            image: image_dependency(),
        }
    }
}
