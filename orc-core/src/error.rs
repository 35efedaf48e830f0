use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reason codes written to the `reason` field of the common conditions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionReason {
    /// The OpenStack resource is up to date
    Success,
    /// The controller expects to be reconciled again
    Progressing,
    /// A retryable error occurred
    TransientError,
    /// The spec cannot be realised as written
    InvalidConfiguration,
    /// The OpenStack resource is in a state the controller cannot recover from
    UnrecoverableError,
    /// More than one OpenStack resource matched an adoption or import search
    DuplicateResource,
    /// A referenced object does not exist and is not protected by a deletion guard
    DependencyNotFound,
}

impl ConditionReason {
    /// The string form used in condition `reason` fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Success => "Success",
            ConditionReason::Progressing => "Progressing",
            ConditionReason::TransientError => "TransientError",
            ConditionReason::InvalidConfiguration => "InvalidConfiguration",
            ConditionReason::UnrecoverableError => "UnrecoverableError",
            ConditionReason::DuplicateResource => "DuplicateResource",
            ConditionReason::DependencyNotFound => "DependencyNotFound",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by a reconcile step
///
/// A [`Error::Terminal`] error means that the object's spec must change before another
/// attempt can succeed, so the controller stops rescheduling the object. Everything else is
/// [`Error::Retryable`] and is retried with a backoff.
#[derive(Debug, Error)]
pub enum Error {
    /// The spec is wrong; do not retry until the generation advances
    #[error("{message}")]
    Terminal {
        /// Reason code surfaced on the conditions
        reason: ConditionReason,
        /// Human readable message surfaced on the conditions
        message: String,
    },

    /// A transient failure, retried with backoff
    #[error(transparent)]
    Retryable(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Construct a terminal error
    pub fn terminal(reason: ConditionReason, message: impl Into<String>) -> Self {
        Error::Terminal {
            reason,
            message: message.into(),
        }
    }

    /// Construct a retryable error from anything error-like
    pub fn retryable(err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Error::Retryable(err.into())
    }

    /// Whether this error should stop rescheduling
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal { .. })
    }

    /// The condition reason for this error
    pub fn reason(&self) -> ConditionReason {
        match self {
            Error::Terminal { reason, .. } => *reason,
            Error::Retryable(_) => ConditionReason::TransientError,
        }
    }
}

impl From<CloudError> for Error {
    fn from(err: CloudError) -> Self {
        Error::Retryable(Box::new(err))
    }
}

/// Error returned by an OpenStack API call
///
/// Only the classification matters to the engine: "not found", "conflict", and whether the
/// failure is worth retrying.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The API answered with a non-success status code
    #[error("openstack returned {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Body or summary of the error
        message: String,
    },

    /// The request never got an answer
    #[error("openstack transport error: {0}")]
    Transport(String),

    /// The reconcile pass that issued the request was cancelled
    #[error("openstack request cancelled")]
    Cancelled,
}

impl CloudError {
    /// A 404 response
    pub fn not_found(message: impl Into<String>) -> Self {
        CloudError::Http {
            status: 404,
            message: message.into(),
        }
    }

    /// A 409 response
    pub fn conflict(message: impl Into<String>) -> Self {
        CloudError::Http {
            status: 409,
            message: message.into(),
        }
    }

    /// A 400 response
    pub fn bad_request(message: impl Into<String>) -> Self {
        CloudError::Http {
            status: 400,
            message: message.into(),
        }
    }

    /// Whether the resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::Http { status: 404, .. })
    }

    /// Whether the request conflicted with the current state of the resource
    pub fn is_conflict(&self) -> bool {
        matches!(self, CloudError::Http { status: 409, .. })
    }

    /// Whether repeating the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Http { status, .. } => *status == 429 || *status >= 500,
            CloudError::Transport(_) | CloudError::Cancelled => true,
        }
    }
}
