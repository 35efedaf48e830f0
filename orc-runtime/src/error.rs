use thiserror::Error;

/// Failure of a reconcile pass, handed to the controller's error policy
///
/// Terminal errors are not represented here: they are written to the object's conditions and
/// the pass returns successfully, waiting for the spec to change.
#[derive(Debug, Error)]
pub enum Error {
    /// The API server rejected a request
    #[error("cluster request failed: {0}")]
    Cluster(#[from] crate::cluster::Error),

    /// A reconcile step failed with a retryable error
    #[error("reconcile failed: {0}")]
    Retryable(String),

    /// The actuator panicked; nothing was written for this pass
    #[error("actuator panicked: {0}")]
    Panicked(String),

    /// The object has no name or namespace
    #[error("object has no {0}")]
    MissingMetadata(&'static str),
}
