//! The contract between the engine and a resource type
use crate::cluster::{Cluster, Object};
use async_trait::async_trait;
use futures::stream::BoxStream;
use orc_core::{
    progress::{Phase, EXTERNAL_UPDATE_POLLING_PERIOD},
    CloudError, ConditionReason, ManagedObject, ReconcileStatus,
};
use std::fmt::{self, Debug};

/// A stream of OpenStack resources returned by a list call
pub type ResourceStream<R> = BoxStream<'static, Result<R, CloudError>>;

/// Why a create did not return a resource
#[derive(Debug)]
pub enum CreateError {
    /// OpenStack rejected the request
    Cloud(CloudError),
    /// Creation cannot proceed yet, typically because a dependency is not ready
    Status(ReconcileStatus),
}

impl From<CloudError> for CreateError {
    fn from(err: CloudError) -> Self {
        CreateError::Cloud(err)
    }
}

impl From<ReconcileStatus> for CreateError {
    fn from(status: ReconcileStatus) -> Self {
        CreateError::Status(status)
    }
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::Cloud(err) => fmt::Display::fmt(err, f),
            CreateError::Status(status) => fmt::Display::fmt(status, f),
        }
    }
}

/// The operations of one resource type against OpenStack
///
/// An actuator is built for a single reconcile pass from the pass's cloud scope. The engine
/// decides which operations to call and in which order; the actuator only translates between
/// the managed object and the cloud API.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// The managed object kind
    type Object: Object + ManagedObject;
    /// The OpenStack resource as returned by the cloud API
    type OsResource: Clone + Debug + Send + Sync + 'static;
    /// A single update step
    type Step: Copy + Debug + Send + Sync + 'static;

    /// The OpenStack ID of a resource, in the form stored in `status.id`
    fn resource_id(&self, resource: &Self::OsResource) -> String;

    async fn get_by_id(&self, id: &str) -> Result<Self::OsResource, CloudError>;

    /// List resources which could be adopted by `obj`
    ///
    /// Returns `None` when the spec does not describe a resource precisely enough to adopt one.
    /// Filters must identify the desired resource uniquely among everything the credentials can
    /// see, composing client-side predicates where the API lacks a filter.
    async fn list_for_adoption(
        &self,
        obj: &Self::Object,
    ) -> Result<Option<ResourceStream<Self::OsResource>>, ReconcileStatus>;

    /// List resources matching the import filter of `obj`
    async fn list_for_import(
        &self,
        obj: &Self::Object,
        filter: &<Self::Object as ManagedObject>::Filter,
    ) -> Result<ResourceStream<Self::OsResource>, ReconcileStatus>;

    async fn create(&self, obj: &Self::Object) -> Result<Self::OsResource, CreateError>;

    /// Start deleting `resource`
    ///
    /// Returning an empty status means the delete was accepted; the engine then polls
    /// [`Actuator::get_by_id`] until the resource is gone.
    async fn delete(&self, obj: &Self::Object, resource: &Self::OsResource) -> Result<ReconcileStatus, CloudError>;

    /// The update steps to run, in order, against an existing resource
    fn reconcile_steps(&self, _obj: &Self::Object, _resource: &Self::OsResource) -> Vec<Self::Step> {
        Vec::new()
    }

    async fn run_step(
        &self,
        _step: Self::Step,
        _obj: &Self::Object,
        _resource: &Self::OsResource,
    ) -> ReconcileStatus {
        ReconcileStatus::ok()
    }

    /// Project the observed resource into `status.resource`
    fn resource_status(&self, resource: &Self::OsResource) -> <Self::Object as ManagedObject>::ResourceStatus;

    /// Whether the resource is fully usable
    fn is_available(&self, _obj: &Self::Object, _resource: &Self::OsResource) -> bool {
        true
    }

    /// Classify an error returned by [`Actuator::create`]
    ///
    /// A conflict means the request can never succeed as written. Resource types whose API
    /// answers 409 while a parent is busy override this to wait instead.
    fn on_create_error(&self, err: CloudError) -> ReconcileStatus {
        if err.is_conflict() || !err.is_retryable() {
            ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, err.to_string())
        } else {
            ReconcileStatus::error(err)
        }
    }

    /// Classify an error returned by [`Actuator::delete`]
    ///
    /// An empty status means the resource is already gone.
    fn on_delete_error(&self, err: CloudError) -> ReconcileStatus {
        if err.is_not_found() {
            ReconcileStatus::ok()
        } else if err.is_conflict() {
            ReconcileStatus::waiting_on_cloud(Phase::Delete, EXTERNAL_UPDATE_POLLING_PERIOD)
        } else {
            ReconcileStatus::error(err)
        }
    }
}

/// A resource type: its object kind, its scope and how to build its actuator
pub trait ResourceController: Send + Sync + 'static {
    /// Short lowercase name, used in finalizers and field managers
    const NAME: &'static str;

    type Object: Object + ManagedObject;
    /// Per-pass cloud clients, built from the object's credentials
    type Scope: Send + Sync + 'static;
    type Actuator<C: Cluster>: Actuator<Object = Self::Object>;

    fn actuator<C: Cluster>(&self, scope: &Self::Scope, cluster: &C) -> Self::Actuator<C>;
}

/// The status for a `spec.resource` field which differs from OpenStack but cannot be updated
pub fn immutable(field: &str) -> ReconcileStatus {
    ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, format!("{field} is immutable"))
}

/// Whether an update payload carries any change
///
/// Update steps build a payload holding only the fields which differ; an empty payload means
/// there is nothing to send.
pub fn has_changes<T: Default + PartialEq>(update: &T) -> bool {
    *update != T::default()
}

/// The status for a step which changed the resource and wants it read again
pub fn updated() -> ReconcileStatus {
    ReconcileStatus::needs_refresh()
}

/// Classify an error returned by an update call made from a step
///
/// A request the cloud rejects as written fails the same way on every retry, so it is terminal
/// until the spec changes. A resource which vanished is retried: the next pass reports it.
pub fn update_error(err: CloudError) -> ReconcileStatus {
    if err.is_retryable() || err.is_not_found() {
        ReconcileStatus::error(err)
    } else {
        ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, err.to_string())
    }
}

/// Wait for a resource which is transitioning on the cloud side
pub fn wait_for(phase: Phase) -> ReconcileStatus {
    ReconcileStatus::waiting_on_cloud(phase, EXTERNAL_UPDATE_POLLING_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq)]
    struct Update {
        name: Option<String>,
    }

    #[test]
    fn empty_updates_have_no_changes() {
        assert!(!has_changes(&Update::default()));
        assert!(has_changes(&Update {
            name: Some("x".into())
        }));
    }

    #[test]
    fn rejected_updates_are_terminal() {
        assert_eq!(update_error(CloudError::bad_request("no")).severity(), orc_core::Severity::Terminal);
        assert_eq!(update_error(CloudError::not_found("gone")).severity(), orc_core::Severity::Retryable);
        assert_eq!(
            update_error(CloudError::Transport("reset".into())).severity(),
            orc_core::Severity::Retryable
        );
    }

    #[test]
    fn immutable_fields_are_terminal() {
        let status = immutable("Image");
        assert_eq!(
            status.terminal_error(),
            Some((ConditionReason::InvalidConfiguration, "Image is immutable".to_string()))
        );
    }
}
