//! The reconciliation engine shared by every OpenStack resource controller
//!
//! A resource type plugs into the engine by implementing [`ResourceController`], which hands
//! out an [`Actuator`] for each reconcile pass. The engine owns everything else: credential
//! resolution, finalizers, adoption and import, the update step loop, deletion, and the
//! `status` transaction.
//!
//! Newcomers should start with [`controller::ControllerBuilder`], which wires a
//! [`reconciler::Reconciler`] onto a [`kube::runtime::Controller`] together with the watches
//! and deletion guards of every declared [`dependency::Dependency`].
#![deny(unsafe_code)]

pub mod actuator;
pub use actuator::{Actuator, CreateError, ResourceController, ResourceStream};

pub mod cluster;
pub use cluster::{Cluster, KubeCluster, Object};

pub mod controller;
pub use controller::{Config, ControllerBuilder};

pub mod dependency;
pub use dependency::Dependency;

mod error;
pub use error::Error;

pub mod guard;
pub mod reconciler;
pub use reconciler::Reconciler;

pub mod scope;
pub use scope::{ScopeError, ScopeFactory};

pub mod search;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
