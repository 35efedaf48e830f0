//! The shape shared by every managed object
//!
//! Every resource kind has the same outer layout:
//!
//! ```yaml
//! spec:
//!   cloudCredentialsRef: {secretName: openstack-clouds, cloudName: openstack}
//!   managementPolicy: managed          # or unmanaged
//!   managedOptions: {onDelete: delete} # or detach
//!   resource: {...}                    # desired attributes, when managed
//!   import: {id: ..., filter: {...}}   # an existing resource, when unmanaged
//! status:
//!   id: ...
//!   resource: {...}                    # observed attributes
//!   conditions: [...]
//! ```
//!
//! The per-kind parts are the `resource` spec, the import `filter` and the observed `resource`
//! status. [`ManagedObject`] exposes the common parts to the engine without it having to know
//! the kind.
use crate::conditions::{self, Condition};
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether the controller owns the lifecycle of the OpenStack resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ManagementPolicy {
    /// Create, update and delete the resource
    #[default]
    Managed,
    /// Only import the resource and report its status
    Unmanaged,
}

/// What happens to a managed OpenStack resource when its object is deleted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnDelete {
    /// Delete the OpenStack resource
    #[default]
    Delete,
    /// Leave the OpenStack resource in place
    Detach,
}

/// Options only meaningful for managed objects
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedOptions {
    #[serde(default)]
    pub on_delete: OnDelete,
}

/// The secret holding `clouds.yaml` and the cloud to use from it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudCredentialsRef {
    /// Name of a secret in the object's namespace
    pub secret_name: String,
    /// Name of the cloud in the secret's `clouds.yaml`
    pub cloud_name: String,
}

/// An existing OpenStack resource to bind to, by ID or by filter
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceImport<F> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<F>,
}

/// The status layout shared by every managed object
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedStatus<S> {
    /// ID of the OpenStack resource, set once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Observed attributes of the OpenStack resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<S>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// An import filter
pub trait ImportFilter: Send + Sync {
    /// Whether no filter field is populated
    fn is_empty(&self) -> bool;
}

/// Access to the common parts of a managed object
pub trait ManagedObject: Resource<DynamicType = ()> {
    /// Desired attributes of the OpenStack resource
    type ResourceSpec: Send + Sync;
    /// Import filter
    type Filter: ImportFilter;
    /// Observed attributes of the OpenStack resource
    type ResourceStatus: Serialize + Send + Sync;

    fn management_policy(&self) -> ManagementPolicy;
    fn managed_options(&self) -> Option<&ManagedOptions>;
    fn credentials_ref(&self) -> &CloudCredentialsRef;
    fn resource_spec(&self) -> Option<&Self::ResourceSpec>;
    fn import(&self) -> Option<&ResourceImport<Self::Filter>>;
    fn managed_status(&self) -> Option<&ManagedStatus<Self::ResourceStatus>>;

    /// The recorded OpenStack resource ID
    fn status_id(&self) -> Option<&str> {
        self.managed_status().and_then(|s| s.id.as_deref())
    }

    /// The ID named by `spec.import.id`
    fn import_id(&self) -> Option<&str> {
        self.import().and_then(|i| i.id.as_deref())
    }

    /// The filter named by `spec.import.filter`
    fn import_filter(&self) -> Option<&Self::Filter> {
        self.import().and_then(|i| i.filter.as_ref())
    }

    fn conditions(&self) -> &[Condition] {
        self.managed_status().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    /// Whether the object is ready to be depended upon
    ///
    /// A dependency is ready once it has an OpenStack ID and its `Available` condition is true.
    fn is_available(&self) -> bool {
        self.status_id().is_some() && conditions::is_true(self.conditions(), conditions::AVAILABLE)
    }

    /// What to do with the OpenStack resource when the object is deleted
    fn on_delete(&self) -> OnDelete {
        match self.management_policy() {
            ManagementPolicy::Unmanaged => OnDelete::Detach,
            ManagementPolicy::Managed => self.managed_options().map(|o| o.on_delete).unwrap_or_default(),
        }
    }

    /// The OpenStack name of the resource: `spec.resource.name` if set, otherwise the object name
    fn resource_name<'a>(&'a self, explicit: Option<&'a str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| self.meta().name.clone())
            .unwrap_or_default()
    }
}

/// Implement [`ManagedObject`] for a custom resource with the common spec and status layout
///
/// The spec must have the fields `cloud_credentials_ref`, `management_policy`,
/// `managed_options`, `resource` and `import`, and the status must be a [`ManagedStatus`].
#[macro_export]
macro_rules! managed_object {
    ($kind:ty, spec = $spec:ty, filter = $filter:ty, status = $status:ty $(,)?) => {
        impl $crate::ManagedObject for $kind {
            type Filter = $filter;
            type ResourceSpec = $spec;
            type ResourceStatus = $status;

            fn management_policy(&self) -> $crate::ManagementPolicy {
                self.spec.management_policy
            }

            fn managed_options(&self) -> Option<&$crate::ManagedOptions> {
                self.spec.managed_options.as_ref()
            }

            fn credentials_ref(&self) -> &$crate::CloudCredentialsRef {
                &self.spec.cloud_credentials_ref
            }

            fn resource_spec(&self) -> Option<&$spec> {
                self.spec.resource.as_ref()
            }

            fn import(&self) -> Option<&$crate::ResourceImport<$filter>> {
                self.spec.import.as_ref()
            }

            fn managed_status(&self) -> Option<&$crate::ManagedStatus<$status>> {
                self.status.as_ref()
            }
        }
    };
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conditions::ConditionStatus;
    use kube::CustomResource;

    #[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
    #[kube(group = "test.k-orc.cloud", version = "v1alpha1", kind = "Widget", namespaced)]
    #[kube(status = "WidgetStatus")]
    #[serde(rename_all = "camelCase")]
    pub struct WidgetSpec {
        #[serde(default)]
        pub cloud_credentials_ref: CloudCredentialsRef,
        #[serde(default)]
        pub management_policy: ManagementPolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub managed_options: Option<ManagedOptions>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub resource: Option<WidgetResourceSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub import: Option<ResourceImport<WidgetFilter>>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
    pub struct WidgetResourceSpec {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
    pub struct WidgetFilter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub name: Option<String>,
    }

    impl ImportFilter for WidgetFilter {
        fn is_empty(&self) -> bool {
            self.name.is_none()
        }
    }

    pub type WidgetStatus = ManagedStatus<String>;

    managed_object!(Widget, spec = WidgetResourceSpec, filter = WidgetFilter, status = String);

    pub fn widget(yaml: &str) -> Widget {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn reads_the_common_layout() {
        let w = widget(
            r#"
            apiVersion: test.k-orc.cloud/v1alpha1
            kind: Widget
            metadata: {name: w1, namespace: ns}
            spec:
              cloudCredentialsRef: {secretName: creds, cloudName: openstack}
              managementPolicy: managed
              managedOptions: {onDelete: detach}
              resource: {}
            status:
              id: abc
              conditions:
              - {type: Available, status: "True", lastTransitionTime: "2024-01-01T00:00:00Z", reason: Success, message: ok}
            "#,
        );
        assert_eq!(w.status_id(), Some("abc"));
        assert_eq!(w.on_delete(), OnDelete::Detach);
        assert_eq!(w.credentials_ref().secret_name, "creds");
        assert!(w.is_available());
        assert_eq!(w.conditions()[0].status, ConditionStatus::True);
        assert_eq!(w.resource_name(w.resource_spec().and_then(|r| r.name.as_deref())), "w1");
    }

    #[test]
    fn unmanaged_objects_always_detach() {
        let w = widget(
            r#"
            apiVersion: test.k-orc.cloud/v1alpha1
            kind: Widget
            metadata: {name: w1, namespace: ns}
            spec:
              managementPolicy: unmanaged
              import: {filter: {name: x}}
            "#,
        );
        assert_eq!(w.on_delete(), OnDelete::Detach);
        assert_eq!(w.import_filter().and_then(|f| f.name.as_deref()), Some("x"));
        assert!(!w.is_available());
    }

    #[test]
    fn available_requires_an_id() {
        let w = widget(
            r#"
            apiVersion: test.k-orc.cloud/v1alpha1
            kind: Widget
            metadata: {name: w1, namespace: ns}
            spec: {resource: {}}
            status:
              conditions:
              - {type: Available, status: "True", lastTransitionTime: "2024-01-01T00:00:00Z", reason: Success, message: ok}
            "#,
        );
        assert!(!w.is_available());
    }
}
