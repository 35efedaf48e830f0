//! The reconcile state machine
//!
//! One pass over one managed object:
//!
//! 1. re-read the object; stop if it is gone,
//! 2. if it is being deleted, wait for foreign finalizers, then detach or delete the OpenStack
//!    resource and drop our finalizer once it is gone,
//! 3. validate the spec and resolve the credentials,
//! 4. make sure a managed object carries our finalizer before touching OpenStack,
//! 5. find the OpenStack resource: by `status.id`, by import ID or filter, or by adoption and
//!    finally creation, recording `status.id` as soon as it is known,
//! 6. run the update steps of managed objects, re-reading the resource when a step changed it,
//! 7. write the status and decide when to come back.
//!
//! A panic anywhere in the pass aborts it without writing anything.
use crate::{
    actuator::{Actuator, CreateError, ResourceController},
    cluster::{self, Cluster},
    dependency::Dependency,
    error::Error,
    scope::{self, ScopeFactory},
    search::{self, at_most_one, Match},
    status,
};
use futures::FutureExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{runtime::controller::Action, Resource, ResourceExt};
use orc_core::{
    conditions::Availability,
    naming,
    progress::{Phase, Severity, DELETE_POLLING_PERIOD, EXTERNAL_UPDATE_POLLING_PERIOD},
    validation, ConditionReason, ManagedObject, ManagementPolicy, OnDelete, ReconcileStatus,
};
use std::{any::Any, panic::AssertUnwindSafe, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

/// How many times one pass re-reads the resource after an update step before rescheduling
pub const MAX_REFRESHES: usize = 5;

/// Delay before the next pass when the refresh budget of a pass ran out
pub const REFRESH_REQUEUE: Duration = Duration::from_secs(1);

type Object<R> = <R as ResourceController>::Object;
type OsResource<R, C> = <<R as ResourceController>::Actuator<C> as Actuator>::OsResource;
type ResourceStatus<R> = <Object<R> as ManagedObject>::ResourceStatus;

/// What the pass learned about the OpenStack resource
struct Observed<S> {
    id: String,
    resource: S,
    available: bool,
}

/// Runs reconcile passes for one resource type
pub struct Reconciler<R: ResourceController, C, F> {
    controller: R,
    cluster: C,
    scopes: F,
    credentials: Dependency<Object<R>, Secret>,
}

impl<R, C, F> Reconciler<R, C, F>
where
    R: ResourceController,
    C: Cluster,
    F: ScopeFactory<Scope = R::Scope>,
{
    pub fn new(controller: R, cluster: C, scopes: F) -> Self {
        Self {
            controller,
            cluster,
            scopes,
            credentials: scope::credentials_dependency(R::NAME),
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// The guarded reference from objects to their credentials secret
    pub fn credentials(&self) -> &Dependency<Object<R>, Secret> {
        &self.credentials
    }

    /// The finalizer this controller places on its own objects
    pub fn finalizer(&self) -> String {
        naming::finalizer(R::NAME)
    }

    /// Run one pass over the current state of `obj`
    ///
    /// Terminal failures are written to the object's conditions and return `Ok`, waiting for the
    /// object to change. Retryable failures are written too, and returned as `Err` so the caller
    /// can back off.
    pub async fn reconcile(&self, obj: &Object<R>, cancel: CancellationToken) -> Result<Action, Error> {
        let namespace = obj.namespace().ok_or(Error::MissingMetadata("namespace"))?;
        let name = obj.meta().name.clone().ok_or(Error::MissingMetadata("name"))?;
        let span = info_span!(
            "reconcile",
            controller = R::NAME,
            namespace = %namespace,
            name = %name,
            id = field::Empty,
        );
        async move {
            let Some(current) = self.cluster.get::<Object<R>>(&namespace, &name).await? else {
                debug!("object no longer exists");
                return Ok(Action::await_change());
            };
            if let Some(id) = current.status_id() {
                Span::current().record("id", id);
            }
            match AssertUnwindSafe(self.reconcile_object(&current, &cancel))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(%message, "reconcile panicked");
                    Err(Error::Panicked(message))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile_object(&self, obj: &Object<R>, cancel: &CancellationToken) -> Result<Action, Error> {
        if obj.meta().deletion_timestamp.is_some() {
            return self.reconcile_delete(obj, cancel).await;
        }

        if let Err(err) = validation::validate(obj) {
            return self.finish(obj, None, err.into()).await;
        }

        let scope = match self.scope(obj, cancel).await {
            Ok(scope) => scope,
            Err(outcome) => return self.finish(obj, None, outcome).await,
        };

        if obj.management_policy() == ManagementPolicy::Managed && !self.has_finalizer(obj) {
            self.set_finalizer(obj, true).await?;
            debug!("added finalizer");
            return Ok(Action::await_change());
        }

        let actuator = self.controller.actuator(&scope, &self.cluster);
        let mut resource = match self.resolve(&actuator, obj).await {
            Ok(resource) => resource,
            Err(outcome) => return self.finish(obj, None, outcome).await,
        };
        let id = actuator.resource_id(&resource);
        Span::current().record("id", id.as_str());

        let mut outcome = ReconcileStatus::ok();
        if obj.management_policy() == ManagementPolicy::Managed && obj.resource_spec().is_some() {
            let mut refreshes = 0;
            loop {
                outcome = self.run_steps(&actuator, obj, &resource).await;
                if !outcome.is_refresh_only() || refreshes == MAX_REFRESHES {
                    break;
                }
                refreshes += 1;
                debug!(refreshes, "resource changed, refreshing");
                match actuator.get_by_id(&id).await {
                    Ok(refreshed) => resource = refreshed,
                    Err(err) => {
                        outcome = err.into();
                        break;
                    }
                }
            }
        }

        let available = actuator.is_available(obj, &resource);
        if !available && outcome.is_ok() {
            outcome = ReconcileStatus::waiting_on_cloud(Phase::Ready, EXTERNAL_UPDATE_POLLING_PERIOD);
        }
        let observed = Observed {
            available,
            resource: actuator.resource_status(&resource),
            id,
        };
        self.finish(obj, Some(observed), outcome).await
    }

    async fn run_steps(
        &self,
        actuator: &R::Actuator<C>,
        obj: &Object<R>,
        resource: &OsResource<R, C>,
    ) -> ReconcileStatus {
        for step in actuator.reconcile_steps(obj, resource) {
            let outcome = actuator.run_step(step, obj, resource).await;
            if !outcome.is_ok() {
                debug!(?step, %outcome, "step did not complete");
                return outcome;
            }
        }
        ReconcileStatus::ok()
    }

    /// Find the OpenStack resource bound to `obj`, recording its ID if it was not known
    async fn resolve(
        &self,
        actuator: &R::Actuator<C>,
        obj: &Object<R>,
    ) -> Result<OsResource<R, C>, ReconcileStatus> {
        if let Some(id) = obj.status_id() {
            return actuator.get_by_id(id).await.map_err(|err| {
                if err.is_not_found() {
                    ReconcileStatus::terminal(
                        ConditionReason::UnrecoverableError,
                        "resource has been deleted from OpenStack",
                    )
                } else {
                    err.into()
                }
            });
        }

        let found = if let Some(id) = obj.import_id() {
            match actuator.get_by_id(id).await {
                Ok(resource) => resource,
                Err(err) if err.is_not_found() => {
                    return Err(ReconcileStatus::waiting_on_cloud(Phase::Create, EXTERNAL_UPDATE_POLLING_PERIOD))
                }
                Err(err) => return Err(err.into()),
            }
        } else if let Some(filter) = obj.import_filter() {
            let candidates = actuator.list_for_import(obj, filter).await?;
            match at_most_one(candidates).await? {
                Match::One(resource) => resource,
                Match::None => {
                    return Err(ReconcileStatus::waiting_on_cloud(Phase::Create, EXTERNAL_UPDATE_POLLING_PERIOD))
                }
                Match::Many => return Err(search::duplicate("import")),
            }
        } else if obj.resource_spec().is_some() {
            self.adopt_or_create(actuator, obj).await?
        } else {
            return Err(ReconcileStatus::terminal(
                ConditionReason::InvalidConfiguration,
                "neither resource nor import is specified",
            ));
        };

        let id = actuator.resource_id(&found);
        self.record_id(obj, &id).await?;
        Ok(found)
    }

    async fn adopt_or_create(
        &self,
        actuator: &R::Actuator<C>,
        obj: &Object<R>,
    ) -> Result<OsResource<R, C>, ReconcileStatus> {
        if let Some(candidates) = actuator.list_for_adoption(obj).await? {
            match at_most_one(candidates).await? {
                Match::One(resource) => {
                    info!(id = %actuator.resource_id(&resource), "adopted existing resource");
                    return Ok(resource);
                }
                Match::Many => return Err(search::duplicate("adoption")),
                Match::None => {}
            }
        }

        match actuator.create(obj).await {
            Ok(resource) => {
                info!(id = %actuator.resource_id(&resource), "created resource");
                Ok(resource)
            }
            Err(CreateError::Cloud(err)) => {
                warn!(%err, "create failed");
                Err(actuator.on_create_error(err))
            }
            Err(CreateError::Status(outcome)) => Err(outcome),
        }
    }

    async fn record_id(&self, obj: &Object<R>, id: &str) -> Result<(), ReconcileStatus> {
        Span::current().record("id", id);
        self.cluster
            .merge_status::<Object<R>>(&obj.namespace().unwrap_or_default(), &obj.name_any(), &status::id_patch(id))
            .await
            .map(|_| ())
            .map_err(|err| ReconcileStatus::error(orc_core::Error::retryable(err)))
    }

    async fn reconcile_delete(&self, obj: &Object<R>, cancel: &CancellationToken) -> Result<Action, Error> {
        let finalizer = self.finalizer();
        if !self.has_finalizer(obj) {
            debug!("deleting without our finalizer, nothing to clean up");
            return Ok(Action::await_change());
        }

        let foreign = obj
            .finalizers()
            .iter()
            .filter(|f| **f != finalizer)
            .map(ReconcileStatus::waiting_on_finalizer)
            .collect::<ReconcileStatus>();
        if foreign.needs_reschedule() {
            debug!(%foreign, "deletion blocked by other finalizers");
            return self.finish(obj, None, foreign).await;
        }

        if obj.on_delete() == OnDelete::Detach {
            self.set_finalizer(obj, false).await?;
            info!("detached resource");
            return Ok(Action::await_change());
        }

        let scope = match self.scope(obj, cancel).await {
            Ok(scope) => scope,
            Err(outcome) => return self.finish(obj, None, outcome).await,
        };
        let actuator = self.controller.actuator(&scope, &self.cluster);

        let existing = match obj.status_id() {
            Some(id) => match actuator.get_by_id(id).await {
                Ok(resource) => Some(resource),
                Err(err) if err.is_not_found() => None,
                Err(err) => return self.finish(obj, None, err.into()).await,
            },
            None => match self.find_orphan(&actuator, obj).await {
                Ok(orphan) => orphan,
                Err(outcome) => return self.finish(obj, None, outcome).await,
            },
        };

        let Some(resource) = existing else {
            self.set_finalizer(obj, false).await?;
            info!("resource is gone, removed finalizer");
            return Ok(Action::await_change());
        };

        let outcome = match actuator.delete(obj, &resource).await {
            Ok(outcome) if outcome.is_ok() => {
                info!("deleting resource");
                ReconcileStatus::waiting_on_cloud(Phase::Delete, DELETE_POLLING_PERIOD)
            }
            Ok(outcome) => outcome,
            Err(err) => {
                let outcome = actuator.on_delete_error(err);
                if outcome.is_ok() {
                    self.set_finalizer(obj, false).await?;
                    info!("resource is gone, removed finalizer");
                    return Ok(Action::await_change());
                }
                outcome
            }
        };

        let observed = Observed {
            id: actuator.resource_id(&resource),
            resource: actuator.resource_status(&resource),
            available: false,
        };
        self.finish(obj, Some(observed), outcome).await
    }

    /// Look for a resource created by an earlier pass which failed before recording its ID
    async fn find_orphan(
        &self,
        actuator: &R::Actuator<C>,
        obj: &Object<R>,
    ) -> Result<Option<OsResource<R, C>>, ReconcileStatus> {
        if obj.resource_spec().is_none() {
            return Ok(None);
        }
        let candidates = match actuator.list_for_adoption(obj).await {
            Ok(Some(candidates)) => candidates,
            Ok(None) => return Ok(None),
            Err(outcome) if outcome.errors().is_empty() => {
                debug!(%outcome, "cannot search for an orphaned resource");
                return Ok(None);
            }
            Err(outcome) => return Err(outcome),
        };
        match at_most_one(candidates).await? {
            Match::None => Ok(None),
            Match::One(orphan) => {
                info!(id = %actuator.resource_id(&orphan), "found orphaned resource");
                Ok(Some(orphan))
            }
            Match::Many => Err(search::duplicate("adoption")),
        }
    }

    async fn scope(&self, obj: &Object<R>, cancel: &CancellationToken) -> Result<R::Scope, ReconcileStatus> {
        scope::resolve(
            &self.cluster,
            &self.scopes,
            &self.credentials,
            obj,
            cancel.child_token(),
        )
        .await
    }

    fn has_finalizer(&self, obj: &Object<R>) -> bool {
        let finalizer = self.finalizer();
        obj.finalizers().iter().any(|f| *f == finalizer)
    }

    async fn set_finalizer(&self, obj: &Object<R>, present: bool) -> Result<(), cluster::Error> {
        let finalizer = self.finalizer();
        let name = obj.name_any();
        let patch = cluster::finalizer_patch::<Object<R>>(&name, present.then_some(finalizer.as_str()));
        self.cluster
            .apply::<Object<R>>(
                &obj.namespace().unwrap_or_default(),
                &name,
                &naming::field_owner(R::NAME, naming::FINALIZER_TXN),
                &patch,
            )
            .await?;
        Ok(())
    }

    /// Write the status for the outcome of the pass and decide when to run again
    async fn finish(
        &self,
        obj: &Object<R>,
        observed: Option<Observed<ResourceStatus<R>>>,
        outcome: ReconcileStatus,
    ) -> Result<Action, Error> {
        let (id, resource, availability) = match &observed {
            Some(o) if o.available => (Some(o.id.as_str()), Some(&o.resource), Availability::Available),
            Some(o) => (Some(o.id.as_str()), Some(&o.resource), Availability::NotAvailable),
            None => {
                let id = obj.status_id();
                let availability = if id.is_some() && outcome.terminal_error().is_none() {
                    Availability::Unknown
                } else {
                    Availability::NotAvailable
                };
                (id, None, availability)
            }
        };
        status::write(&self.cluster, R::NAME, obj, id, resource, availability, &outcome).await?;
        action_for(&outcome)
    }
}

/// Decide how the controller should follow up on an outcome
pub fn action_for(outcome: &ReconcileStatus) -> Result<Action, Error> {
    match outcome.severity() {
        Severity::Ok => Ok(Action::await_change()),
        Severity::Terminal => {
            info!(%outcome, "reconcile failed terminally, waiting for the object to change");
            Ok(Action::await_change())
        }
        Severity::Retryable => Err(Error::Retryable(outcome.error_message().unwrap_or_default())),
        Severity::Waiting | Severity::NeedsRefresh => {
            let requeue = outcome.requeue();
            debug!(%outcome, ?requeue, "waiting");
            if !requeue.is_zero() {
                Ok(Action::requeue(requeue))
            } else if outcome.severity() == Severity::NeedsRefresh {
                Ok(Action::requeue(REFRESH_REQUEUE))
            } else {
                Ok(Action::await_change())
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
