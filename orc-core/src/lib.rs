//! Types and traits shared by every OpenStack resource controller
//!
//! This crate holds the client-less half of the controller: the shape of a managed object,
//! the `Available`/`Progressing` conditions, the [`ReconcileStatus`] progress model and the
//! error taxonomy. The engine that drives these lives in `orc-runtime`.
#![deny(unsafe_code)]

pub mod conditions;
pub use conditions::{Availability, Condition, ConditionStatus};

mod error;
pub use error::{CloudError, ConditionReason, Error};

pub mod naming;

pub mod object;
pub use object::{
    CloudCredentialsRef, ImportFilter, ManagedObject, ManagedOptions, ManagedStatus, ManagementPolicy,
    OnDelete, ResourceImport,
};

pub mod progress;
pub use progress::{Phase, Progress, ReconcileStatus, Severity};

pub mod validation;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
