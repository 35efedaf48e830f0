//! OpenStack resource controllers
//!
//! One module per resource kind, each holding the custom resource definition, its
//! [`Actuator`](orc_runtime::Actuator) and the [`ResourceController`] that builds it. The kinds
//! talk to OpenStack through the service traits in [`osclients`], obtained per reconcile pass
//! from the `clouds.yaml` credentials secret by [`scope::CloudsYamlScopes`].
//!
//! [`controller`] starts any of them by name:
//!
//! ```no_run
//! # async fn doc(client: kube::Client) -> Result<(), orc_controllers::UnknownController> {
//! use orc_controllers::scope::{CloudsYamlScopes, InMemoryConnector};
//! use tokio_util::sync::CancellationToken;
//!
//! let scopes = CloudsYamlScopes::new(InMemoryConnector::default());
//! let shutdown = CancellationToken::new();
//! orc_controllers::controller("network", scopes, client, Default::default(), shutdown)?.await;
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]

use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Client, CustomResourceExt};
use orc_core::{ConditionReason, ManagedObject, ReconcileStatus};
use orc_runtime::{Cluster, Config, ControllerBuilder, CreateError, Dependency, Object, ResourceController};
use scope::{CloudsYamlScopes, Connector};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod osclients;
pub mod scope;
pub mod tags;

pub mod floatingip;
pub mod image;
pub mod lbpool;
pub mod loadbalancer;
pub mod network;
pub mod server;
pub mod subnet;

/// Names of every controller, in dependency order
pub const CONTROLLERS: &[&str] = &[
    network::NetworkController::NAME,
    subnet::SubnetController::NAME,
    floatingip::FloatingIPController::NAME,
    loadbalancer::LoadBalancerController::NAME,
    lbpool::LBPoolController::NAME,
    image::ImageController::NAME,
    server::ServerController::NAME,
];

/// The definitions of every custom resource served by the controllers
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        network::Network::crd(),
        subnet::Subnet::crd(),
        floatingip::FloatingIP::crd(),
        loadbalancer::LoadBalancer::crd(),
        lbpool::LBPool::crd(),
        image::Image::crd(),
        server::Server::crd(),
    ]
}

#[derive(Debug, Error)]
#[error("unknown controller {0:?}, expected one of {CONTROLLERS:?}")]
pub struct UnknownController(pub String);

/// Build the controller called `name`, with the watches and guards of its dependencies
///
/// The returned future runs until `shutdown` is cancelled.
pub fn controller<C: Connector>(
    name: &str,
    scopes: CloudsYamlScopes<C>,
    client: Client,
    config: Config,
    shutdown: CancellationToken,
) -> Result<BoxFuture<'static, ()>, UnknownController> {
    let run = match name {
        network::NetworkController::NAME => {
            ControllerBuilder::new(network::NetworkController, scopes, client, config, shutdown)
                .run()
                .boxed()
        }
        subnet::SubnetController::NAME => {
            ControllerBuilder::new(subnet::SubnetController, scopes, client, config, shutdown)
                .depends_on(subnet::network_dependency())
                .depends_on(subnet::import_network_dependency())
                .run()
                .boxed()
        }
        floatingip::FloatingIPController::NAME => {
            ControllerBuilder::new(floatingip::FloatingIPController, scopes, client, config, shutdown)
                .depends_on(floatingip::network_dependency())
                .depends_on(floatingip::import_network_dependency())
                .run()
                .boxed()
        }
        loadbalancer::LoadBalancerController::NAME => {
            ControllerBuilder::new(loadbalancer::LoadBalancerController, scopes, client, config, shutdown)
                .depends_on(loadbalancer::vip_subnet_dependency())
                .run()
                .boxed()
        }
        lbpool::LBPoolController::NAME => {
            ControllerBuilder::new(lbpool::LBPoolController, scopes, client, config, shutdown)
                .depends_on(lbpool::load_balancer_dependency())
                .depends_on(lbpool::import_load_balancer_dependency())
                .run()
                .boxed()
        }
        image::ImageController::NAME => {
            ControllerBuilder::new(image::ImageController, scopes, client, config, shutdown)
                .run()
                .boxed()
        }
        server::ServerController::NAME => {
            ControllerBuilder::new(server::ServerController, scopes, client, config, shutdown)
                .depends_on(server::image_dependency())
                .run()
                .boxed()
        }
        other => return Err(UnknownController(other.to_owned())),
    };
    Ok(run)
}

pub(crate) fn no_resource() -> CreateError {
    ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, "resource must be specified").into()
}

/// The cloud ID of the object `dep` points at, if `source` references one
///
/// A reference to an object which is not available yet is returned as the wait.
pub(crate) async fn dependency_id<S, T, C>(
    dep: &Dependency<S, T>,
    cluster: &C,
    source: &S,
) -> Result<Option<String>, ReconcileStatus>
where
    S: Object,
    T: Object + ManagedObject,
    C: Cluster,
{
    let target = dep.fetch_one(cluster, source).await?;
    Ok(target.and_then(|t| t.status_id().map(str::to_owned)))
}

/// [`dependency_id`] for a reference the spec cannot omit
pub(crate) async fn required_id<S, T, C>(
    dep: &Dependency<S, T>,
    cluster: &C,
    source: &S,
) -> Result<String, ReconcileStatus>
where
    S: Object,
    T: Object + ManagedObject,
    C: Cluster,
{
    dependency_id(dep, cluster, source).await?.ok_or_else(|| {
        ReconcileStatus::terminal(
            ConditionReason::InvalidConfiguration,
            format!("{} must be specified", dep.index_name()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_controller_serves_a_distinct_kind() {
        let crds = crds();
        assert_eq!(crds.len(), CONTROLLERS.len());
        let mut kinds = crds.iter().map(|crd| crd.spec.names.kind.clone()).collect::<Vec<_>>();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), CONTROLLERS.len());
        assert!(crds.iter().all(|crd| crd.spec.group == "openstack.k-orc.cloud"));
    }
}
