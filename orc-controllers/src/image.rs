//! Glance images
use crate::{
    osclients::{self as os, Clients, ImageClient, ImageCreate, ImageList, ImageUpdate},
    tags,
};
use async_trait::async_trait;
use kube::CustomResource;
use orc_core::{
    CloudCredentialsRef, CloudError, ConditionReason, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus,
    ManagementPolicy, Phase, ReconcileStatus, ResourceImport,
};
use orc_runtime::{actuator, Actuator, Cluster, CreateError, ResourceController, ResourceStream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const ACTIVE: &str = "active";

#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(group = "openstack.k-orc.cloud", version = "v1alpha1", kind = "Image", namespaced)]
#[kube(status = "ImageStatus", shortname = "osimage")]
#[kube(printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.id"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.resource.status"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub cloud_credentials_ref: CloudCredentialsRef,
    #[serde(default)]
    pub management_policy: ManagementPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_options: Option<ManagedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ImageResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ResourceImport<ImageFilter>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `public`, `private`, `shared` or `community`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    /// e.g. `qcow2`
    pub disk_format: String,
    /// e.g. `bare`
    pub container_format: String,
    #[serde(default, rename = "minDiskGB", skip_serializing_if = "Option::is_none")]
    pub min_disk_gb: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ImportFilter for ImageFilter {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageResourceStatus {
    pub name: String,
    pub status: String,
    pub visibility: String,
    pub disk_format: String,
    pub container_format: String,
    #[serde(rename = "minDiskGB")]
    pub min_disk_gb: i32,
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub type ImageStatus = ManagedStatus<ImageResourceStatus>;

orc_core::managed_object!(
    Image,
    spec = ImageResourceSpec,
    filter = ImageFilter,
    status = ImageResourceStatus,
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageStep {
    Status,
    Update,
}

pub struct ImageActuator {
    client: Arc<dyn ImageClient>,
}

fn update_for(name: String, spec: &ImageResourceSpec, image: &os::Image) -> ImageUpdate {
    ImageUpdate {
        name: (name != image.name).then_some(name),
        protected: spec.protected.filter(|p| *p != image.protected),
        tags: (!tags::in_sync(&spec.tags, &image.tags)).then(|| tags::normalize(&spec.tags)),
    }
}

#[async_trait]
impl Actuator for ImageActuator {
    type Object = Image;
    type OsResource = os::Image;
    type Step = ImageStep;

    fn resource_id(&self, image: &os::Image) -> String {
        image.id.clone()
    }

    async fn get_by_id(&self, id: &str) -> Result<os::Image, CloudError> {
        self.client.get_image(id).await
    }

    async fn list_for_adoption(&self, obj: &Image) -> Result<Option<ResourceStream<os::Image>>, ReconcileStatus> {
        let Some(resource) = obj.resource_spec() else {
            return Ok(None);
        };
        Ok(Some(self.client.list_images(&ImageList {
            name: Some(obj.resource_name(resource.name.as_deref())),
            tags: Vec::new(),
        })))
    }

    async fn list_for_import(
        &self,
        _obj: &Image,
        filter: &ImageFilter,
    ) -> Result<ResourceStream<os::Image>, ReconcileStatus> {
        Ok(self.client.list_images(&ImageList {
            name: filter.name.clone(),
            tags: filter.tags.clone(),
        }))
    }

    async fn create(&self, obj: &Image) -> Result<os::Image, CreateError> {
        let resource = obj.resource_spec().ok_or_else(crate::no_resource)?;
        let opts = ImageCreate {
            name: obj.resource_name(resource.name.as_deref()),
            visibility: resource.visibility.clone(),
            disk_format: resource.disk_format.clone(),
            container_format: resource.container_format.clone(),
            min_disk_gb: resource.min_disk_gb,
            protected: resource.protected,
            tags: tags::normalize(&resource.tags),
        };
        Ok(self.client.create_image(&opts).await?)
    }

    /// Glance refuses to delete a protected image, so protection is lifted first
    async fn delete(&self, _obj: &Image, image: &os::Image) -> Result<ReconcileStatus, CloudError> {
        if image.protected {
            info!(id = %image.id, "removing protection before delete");
            self.client
                .update_image(&image.id, &ImageUpdate {
                    protected: Some(false),
                    ..ImageUpdate::default()
                })
                .await?;
        }
        self.client.delete_image(&image.id).await?;
        Ok(ReconcileStatus::ok())
    }

    fn reconcile_steps(&self, _obj: &Image, _image: &os::Image) -> Vec<ImageStep> {
        vec![ImageStep::Status, ImageStep::Update]
    }

    async fn run_step(&self, step: ImageStep, obj: &Image, image: &os::Image) -> ReconcileStatus {
        let Some(resource) = obj.resource_spec() else {
            return ReconcileStatus::ok();
        };
        match step {
            ImageStep::Status => match image.status.as_str() {
                "queued" | "saving" | "uploading" | "importing" => actuator::wait_for(Phase::Ready),
                "killed" | "deleted" | "pending_delete" => ReconcileStatus::terminal(
                    ConditionReason::UnrecoverableError,
                    format!("image is {}", image.status),
                ),
                _ => ReconcileStatus::ok(),
            },
            ImageStep::Update => {
                let update = update_for(obj.resource_name(resource.name.as_deref()), resource, image);
                if !actuator::has_changes(&update) {
                    return ReconcileStatus::ok();
                }
                debug!(?update, "updating image");
                match self.client.update_image(&image.id, &update).await {
                    Ok(_) => actuator::updated(),
                    Err(err) => actuator::update_error(err),
                }
            }
        }
    }

    fn resource_status(&self, image: &os::Image) -> ImageResourceStatus {
        ImageResourceStatus {
            name: image.name.clone(),
            status: image.status.clone(),
            visibility: image.visibility.clone(),
            disk_format: image.disk_format.clone(),
            container_format: image.container_format.clone(),
            min_disk_gb: image.min_disk_gb,
            protected: image.protected,
            tags: tags::normalize(&image.tags),
        }
    }

    fn is_available(&self, _obj: &Image, image: &os::Image) -> bool {
        image.status == ACTIVE
    }
}

pub struct ImageController;

impl ResourceController for ImageController {
    type Actuator<C: Cluster> = ImageActuator;
    type Object = Image;
    type Scope = Clients;

    const NAME: &'static str = "image";

    fn actuator<C: Cluster>(&self, clients: &Clients, _cluster: &C) -> ImageActuator {
        ImageActuator {
            client: clients.image.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_runtime::testing::FakeCluster;

    #[tokio::test]
    async fn protected_images_are_unprotected_then_deleted() {
        let cloud = os::mock::MockCloud::new();
        let id = cloud.insert_image(os::Image {
            name: "img".into(),
            status: ACTIVE.into(),
            protected: true,
            ..os::Image::default()
        });
        let actuator = ImageController.actuator(&Clients::from_cloud(cloud.clone()), &FakeCluster::default());
        let image = cloud.image(&id).unwrap();

        let status = actuator.delete(&Image::new("img", ImageSpec::default()), &image).await.unwrap();
        assert!(status.is_ok());
        assert!(cloud.image(&id).is_none());
        assert_eq!(cloud.calls("update_image"), 1);
    }

    #[test]
    fn unset_protection_is_left_alone() {
        let spec = ImageResourceSpec {
            disk_format: "qcow2".into(),
            container_format: "bare".into(),
            ..ImageResourceSpec::default()
        };
        let image = os::Image {
            name: "img".into(),
            protected: true,
            ..os::Image::default()
        };
        assert!(!actuator::has_changes(&update_for("img".into(), &spec, &image)));
    }
}
