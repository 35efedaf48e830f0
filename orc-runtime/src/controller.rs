//! Wiring a [`Reconciler`] onto a [`kube::runtime::Controller`]
use crate::{
    actuator::ResourceController,
    cluster::{KubeCluster, Object},
    dependency::{BecameAvailable, Dependency},
    error::Error,
    guard,
    reconciler::Reconciler,
    scope::ScopeFactory,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use kube::{
    runtime::{self, controller::Action, reflector::ObjectRef, watcher, Controller},
    Api, Client, ResourceExt,
};
use orc_core::ManagedObject;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Settings shared by every controller of a manager
#[derive(Clone, Debug)]
pub struct Config {
    /// Only watch this namespace; every namespace when `None`
    pub namespace: Option<String>,
    /// First delay after a retryable failure
    pub min_backoff: Duration,
    /// Longest delay between retries of a failing object
    pub max_backoff: Duration,
    /// Objects reconciled in parallel by one controller, 0 for no limit
    pub concurrency: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            concurrency: 0,
        }
    }
}

impl Config {
    /// An [`Api`] over the watched namespaces
    pub fn api<K: Object>(&self, client: &Client) -> Api<K> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        }
    }

    pub fn runtime(&self) -> runtime::Config {
        runtime::Config::default().concurrency(self.concurrency)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(usize::MAX)
    }
}

/// Per-object exponential backoff for retryable failures, reset by a successful pass
pub struct Backoffs<K: Object> {
    builder: ExponentialBuilder,
    max: Duration,
    current: Mutex<HashMap<ObjectRef<K>, ExponentialBackoff>>,
}

impl<K: Object> Backoffs<K> {
    pub fn new(config: &Config) -> Self {
        Self {
            builder: config.backoff(),
            max: config.max_backoff,
            current: Mutex::default(),
        }
    }

    /// The delay before retrying `obj` after another failure
    pub fn next(&self, obj: &ObjectRef<K>) -> Duration {
        self.current
            .lock()
            .entry(obj.clone())
            .or_insert_with(|| self.builder.clone().build())
            .next()
            .unwrap_or(self.max)
    }

    pub fn reset(&self, obj: &ObjectRef<K>) {
        self.current.lock().remove(obj);
    }
}

struct Context<R: ResourceController, F> {
    reconciler: Reconciler<R, KubeCluster, F>,
    backoffs: Backoffs<R::Object>,
    shutdown: CancellationToken,
}

async fn reconcile<R, F>(obj: Arc<R::Object>, ctx: Arc<Context<R, F>>) -> Result<Action, Error>
where
    R: ResourceController,
    F: ScopeFactory<Scope = R::Scope>,
{
    let result = ctx.reconciler.reconcile(&obj, ctx.shutdown.child_token()).await;
    if result.is_ok() {
        ctx.backoffs.reset(&ObjectRef::from_obj(obj.as_ref()));
    }
    result
}

fn error_policy<R, F>(obj: Arc<R::Object>, err: &Error, ctx: Arc<Context<R, F>>) -> Action
where
    R: ResourceController,
    F: ScopeFactory<Scope = R::Scope>,
{
    let delay = ctx.backoffs.next(&ObjectRef::from_obj(obj.as_ref()));
    warn!(
        controller = R::NAME,
        namespace = obj.namespace().unwrap_or_default(),
        name = %obj.name_any(),
        %err,
        ?delay,
        "reconcile failed, retrying"
    );
    Action::requeue(delay)
}

/// Builds the controller of one resource type together with its dependency watches and guards
///
/// ```ignore
/// ControllerBuilder::new(SubnetController, scopes, client, config, shutdown)
///     .depends_on(subnet::network_dependency())
///     .run()
///     .await;
/// ```
pub struct ControllerBuilder<R: ResourceController, F> {
    reconciler: Reconciler<R, KubeCluster, F>,
    controller: Controller<R::Object>,
    client: Client,
    config: Config,
    shutdown: CancellationToken,
    guards: Vec<BoxFuture<'static, ()>>,
}

impl<R, F> ControllerBuilder<R, F>
where
    R: ResourceController,
    F: ScopeFactory<Scope = R::Scope>,
{
    /// A controller for `R`, already depending on its credentials secrets
    pub fn new(resource: R, scopes: F, client: Client, config: Config, shutdown: CancellationToken) -> Self {
        let reconciler = Reconciler::new(resource, KubeCluster::new(client.clone()), scopes);
        let credentials = reconciler.credentials().clone();
        let controller = Controller::new(config.api::<R::Object>(&client), watcher::Config::default());
        Self {
            reconciler,
            controller,
            client,
            config,
            shutdown,
            guards: Vec::new(),
        }
        .depends_on_with(credentials, |_| true)
    }

    /// Reconcile sources of `dependency` when a target becomes available, and guard the targets
    pub fn depends_on<T: Object + ManagedObject>(self, dependency: Dependency<R::Object, T>) -> Self {
        self.depends_on_with(dependency, T::is_available)
    }

    /// [`ControllerBuilder::depends_on`] with a custom readiness check
    pub fn depends_on_with<T: Object>(mut self, dependency: Dependency<R::Object, T>, ready: fn(&T) -> bool) -> Self {
        let sources = self.controller.store();
        let became_available = BecameAvailable::new(ready);
        let mapper = dependency.clone();
        self.controller = self.controller.watches(
            self.config.api::<T>(&self.client),
            watcher::Config::default(),
            move |target: T| {
                if became_available.observe(&target) {
                    mapper.requests_for(&sources.state(), &target)
                } else {
                    Vec::new()
                }
            },
        );
        if dependency.deletion_guard().is_some() {
            self.guards.push(
                guard::run(
                    self.client.clone(),
                    dependency,
                    self.config.clone(),
                    self.shutdown.clone(),
                )
                .boxed(),
            );
        }
        self
    }

    /// Run the controller and its guards until the shutdown token is cancelled
    pub async fn run(self) {
        info!(controller = R::NAME, kind = %<R::Object as kube::Resource>::kind(&()), "starting controller");
        let ctx = Arc::new(Context {
            reconciler: self.reconciler,
            backoffs: Backoffs::new(&self.config),
            shutdown: self.shutdown.clone(),
        });
        let main = self
            .controller
            .with_config(self.config.runtime())
            .graceful_shutdown_on(self.shutdown.cancelled_owned())
            .run(reconcile::<R, F>, error_policy::<R, F>, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => tracing::debug!(controller = R::NAME, object = %obj, "reconciled"),
                    Err(err) => tracing::debug!(controller = R::NAME, %err, "reconcile stream error"),
                }
            });
        futures::future::join(main, futures::future::join_all(self.guards)).await;
        info!(controller = R::NAME, "controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::Thing;

    #[test]
    fn backoff_grows_to_the_cap_and_resets() {
        let config = Config {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            ..Config::default()
        };
        let backoffs = Backoffs::<Thing>::new(&config);
        let a = ObjectRef::new("a").within("ns");
        let b = ObjectRef::new("b").within("ns");

        let delays = (0..4).map(|_| backoffs.next(&a)).collect::<Vec<_>>();
        assert_eq!(delays, vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(4),
        ]);
        assert_eq!(backoffs.next(&b), Duration::from_secs(1));

        backoffs.reset(&a);
        assert_eq!(backoffs.next(&a), Duration::from_secs(1));
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert!(config.namespace.is_none());
    }
}
