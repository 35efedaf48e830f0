//! The outcome of a reconcile step, and how outcomes compose
use crate::error::{ConditionReason, Error};
use std::{fmt, time::Duration};

/// The time to wait before polling OpenStack again while waiting for an external change
pub const EXTERNAL_UPDATE_POLLING_PERIOD: Duration = Duration::from_secs(15);

/// The time to wait between checks that a delete has completed
pub const DELETE_POLLING_PERIOD: Duration = Duration::from_secs(1);

/// The lifecycle phase a wait refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for something to exist
    Create,
    /// Waiting for an update to be applied
    Update,
    /// Waiting for something to become usable
    Ready,
    /// Waiting for something to go away
    Delete,
}

/// A single reason to come back later
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The cloud resource changed; re-read it and run the steps again
    NeedsRefresh,
    /// Waiting for another managed object
    WaitingOnObject {
        /// Kind of the object, e.g. `Network`
        kind: String,
        /// Name of the object in the source's namespace
        name: String,
        /// What we are waiting for it to do
        phase: Phase,
    },
    /// Waiting for OpenStack, polling at the given interval
    WaitingOnCloud {
        /// What we are waiting for the cloud resource to do
        phase: Phase,
        /// How long to wait before looking again
        poll_interval: Duration,
    },
    /// Waiting for a foreign finalizer to be removed from the object
    WaitingOnFinalizer(String),
}

impl Progress {
    /// How long to wait before reconciling again, or zero to wait for a watch event
    pub fn requeue(&self) -> Duration {
        match self {
            Progress::WaitingOnCloud { poll_interval, .. } => *poll_interval,
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::NeedsRefresh => f.write_str("Resource status will be refreshed"),
            Progress::WaitingOnObject { kind, name, phase } => {
                let outcome = match phase {
                    Phase::Create => "Created",
                    Phase::Update => "Updated",
                    Phase::Ready => "Ready",
                    Phase::Delete => "Deleted",
                };
                write!(f, "Waiting for {kind}/{name} to be {outcome}")
            }
            Progress::WaitingOnCloud { phase, .. } => {
                let outcome = match phase {
                    Phase::Create => "be created externally",
                    Phase::Update => "be updated",
                    Phase::Ready => "be ready",
                    Phase::Delete => "be deleted",
                };
                write!(f, "Waiting for OpenStack resource to {outcome}")
            }
            Progress::WaitingOnFinalizer(finalizer) => {
                write!(f, "Waiting for finalizer {finalizer} to be removed")
            }
        }
    }
}

/// How strongly a [`ReconcileStatus`] blocks further progress, weakest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Nothing to do
    Ok,
    /// Re-read the resource and run again
    NeedsRefresh,
    /// Waiting on an object, the cloud, or a finalizer
    Waiting,
    /// A transient error occurred
    Retryable,
    /// A terminal error occurred
    Terminal,
}

/// The merged outcome of one or more reconcile steps
///
/// The empty status is "Ok". Statuses compose with [`ReconcileStatus::merge`], which keeps every
/// wait event and every error: the merged value reschedules after the longest requested poll
/// interval and reports the most blocking [`Severity`] of its parts.
#[derive(Debug, Default)]
#[must_use]
pub struct ReconcileStatus {
    progress: Vec<Progress>,
    errors: Vec<Error>,
}

impl ReconcileStatus {
    /// The status of a step which completed
    pub fn ok() -> Self {
        Self::default()
    }

    /// Wait for another managed object to reach `phase`
    pub fn waiting_on_object(kind: impl Into<String>, name: impl Into<String>, phase: Phase) -> Self {
        Progress::WaitingOnObject {
            kind: kind.into(),
            name: name.into(),
            phase,
        }
        .into()
    }

    /// Poll OpenStack until the resource reaches `phase`
    pub fn waiting_on_cloud(phase: Phase, poll_interval: Duration) -> Self {
        Progress::WaitingOnCloud { phase, poll_interval }.into()
    }

    /// Wait until a foreign finalizer has been removed
    pub fn waiting_on_finalizer(finalizer: impl Into<String>) -> Self {
        Progress::WaitingOnFinalizer(finalizer.into()).into()
    }

    /// Ask the engine to re-read the cloud resource and run the steps again
    pub fn needs_refresh() -> Self {
        Progress::NeedsRefresh.into()
    }

    /// Fail with a terminal error
    pub fn terminal(reason: ConditionReason, message: impl Into<String>) -> Self {
        Error::terminal(reason, message).into()
    }

    /// Fail with any error
    pub fn error(err: impl Into<Error>) -> Self {
        Self {
            progress: Vec::new(),
            errors: vec![err.into()],
        }
    }

    /// Combine two statuses, keeping everything both of them report
    pub fn merge(mut self, other: ReconcileStatus) -> Self {
        self.progress.extend(other.progress);
        self.errors.extend(other.errors);
        self
    }

    /// Append a single wait event
    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress.push(progress);
        self
    }

    /// Whether no step reported anything
    pub fn is_ok(&self) -> bool {
        self.progress.is_empty() && self.errors.is_empty()
    }

    /// Whether the reconcile should stop here and come back later
    pub fn needs_reschedule(&self) -> bool {
        !self.is_ok()
    }

    /// Whether the only thing reported is a request to refresh the cloud resource
    pub fn is_refresh_only(&self) -> bool {
        self.errors.is_empty()
            && !self.progress.is_empty()
            && self.progress.iter().all(|p| matches!(p, Progress::NeedsRefresh))
    }

    /// The wait events in the order they were reported
    pub fn progress(&self) -> &[Progress] {
        &self.progress
    }

    /// The errors in the order they were reported
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Take ownership of the errors
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    /// The longest poll interval requested by any wait event
    pub fn requeue(&self) -> Duration {
        self.progress
            .iter()
            .map(Progress::requeue)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// The strongest blocking signal in this status
    pub fn severity(&self) -> Severity {
        if self.errors.iter().any(Error::is_terminal) {
            Severity::Terminal
        } else if !self.errors.is_empty() {
            Severity::Retryable
        } else if self.progress.iter().any(|p| !matches!(p, Progress::NeedsRefresh)) {
            Severity::Waiting
        } else if !self.progress.is_empty() {
            Severity::NeedsRefresh
        } else {
            Severity::Ok
        }
    }

    /// The first terminal error, if any
    pub fn terminal_error(&self) -> Option<(ConditionReason, String)> {
        self.errors.iter().find_map(|err| match err {
            Error::Terminal { reason, message } => Some((*reason, message.clone())),
            Error::Retryable(_) => None,
        })
    }

    /// Messages describing the wait events
    pub fn messages(&self) -> Vec<String> {
        self.progress.iter().map(ToString::to_string).collect()
    }

    /// A single message describing the errors, if there are any
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl From<Progress> for ReconcileStatus {
    fn from(progress: Progress) -> Self {
        Self {
            progress: vec![progress],
            errors: Vec::new(),
        }
    }
}

impl From<Error> for ReconcileStatus {
    fn from(err: Error) -> Self {
        Self::error(err)
    }
}

impl From<crate::CloudError> for ReconcileStatus {
    fn from(err: crate::CloudError) -> Self {
        Self::error(err)
    }
}

impl Extend<ReconcileStatus> for ReconcileStatus {
    fn extend<T: IntoIterator<Item = ReconcileStatus>>(&mut self, iter: T) {
        for status in iter {
            self.progress.extend(status.progress);
            self.errors.extend(status.errors);
        }
    }
}

impl FromIterator<ReconcileStatus> for ReconcileStatus {
    fn from_iter<T: IntoIterator<Item = ReconcileStatus>>(iter: T) -> Self {
        let mut status = ReconcileStatus::ok();
        status.extend(iter);
        status
    }
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("Ok");
        }
        let parts = self
            .messages()
            .into_iter()
            .chain(self.errors.iter().map(ToString::to_string))
            .collect::<Vec<_>>();
        f.write_str(&parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CloudError;

    fn render(status: &ReconcileStatus) -> (Severity, Duration, String) {
        (status.severity(), status.requeue(), status.to_string())
    }

    fn samples() -> Vec<fn() -> ReconcileStatus> {
        vec![
            ReconcileStatus::ok,
            ReconcileStatus::needs_refresh,
            || ReconcileStatus::waiting_on_object("Network", "n1", Phase::Ready),
            || ReconcileStatus::waiting_on_cloud(Phase::Ready, Duration::from_secs(15)),
            || ReconcileStatus::waiting_on_cloud(Phase::Delete, Duration::from_secs(1)),
            || ReconcileStatus::waiting_on_finalizer("openstack.k-orc.cloud/subnet"),
            || ReconcileStatus::error(CloudError::Transport("reset".into())),
            || ReconcileStatus::terminal(ConditionReason::InvalidConfiguration, "bad"),
        ]
    }

    #[test]
    fn merge_is_associative() {
        for a in samples() {
            for b in samples() {
                for c in samples() {
                    let left = a().merge(b()).merge(c());
                    let right = a().merge(b().merge(c()));
                    assert_eq!(render(&left), render(&right));
                }
            }
        }
    }

    #[test]
    fn ok_is_the_identity() {
        for a in samples() {
            assert_eq!(render(&a().merge(ReconcileStatus::ok())), render(&a()));
            assert_eq!(render(&ReconcileStatus::ok().merge(a())), render(&a()));
        }
    }

    #[test]
    fn merge_keeps_the_strongest_signal_and_longest_interval() {
        let status = ReconcileStatus::waiting_on_cloud(Phase::Delete, Duration::from_secs(1))
            .merge(ReconcileStatus::waiting_on_cloud(Phase::Ready, Duration::from_secs(15)))
            .merge(ReconcileStatus::needs_refresh());
        assert_eq!(status.severity(), Severity::Waiting);
        assert_eq!(status.requeue(), Duration::from_secs(15));

        let status = status.merge(ReconcileStatus::error(CloudError::Transport("reset".into())));
        assert_eq!(status.severity(), Severity::Retryable);

        let status = status.merge(ReconcileStatus::terminal(
            ConditionReason::DuplicateResource,
            "found 2",
        ));
        assert_eq!(status.severity(), Severity::Terminal);
        assert_eq!(
            status.terminal_error(),
            Some((ConditionReason::DuplicateResource, "found 2".to_string()))
        );
        assert_eq!(status.errors().len(), 2);
    }

    #[test]
    fn messages_name_what_we_wait_for() {
        assert_eq!(
            Progress::WaitingOnObject {
                kind: "Network".into(),
                name: "N".into(),
                phase: Phase::Ready
            }
            .to_string(),
            "Waiting for Network/N to be Ready"
        );
        assert_eq!(
            Progress::WaitingOnCloud {
                phase: Phase::Create,
                poll_interval: EXTERNAL_UPDATE_POLLING_PERIOD
            }
            .to_string(),
            "Waiting for OpenStack resource to be created externally"
        );
        assert_eq!(
            Progress::WaitingOnFinalizer("example.com/f".into()).to_string(),
            "Waiting for finalizer example.com/f to be removed"
        );
    }

    #[test]
    fn refresh_only_is_distinguished_from_waits() {
        assert!(ReconcileStatus::needs_refresh().is_refresh_only());
        assert!(!ReconcileStatus::ok().is_refresh_only());
        assert!(!ReconcileStatus::needs_refresh()
            .merge(ReconcileStatus::waiting_on_finalizer("f"))
            .is_refresh_only());
    }

    #[test]
    fn collects_from_iterators() {
        let status: ReconcileStatus = vec![
            ReconcileStatus::ok(),
            ReconcileStatus::waiting_on_object("Subnet", "s", Phase::Create),
            ReconcileStatus::waiting_on_object("Network", "n", Phase::Ready),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            status.messages(),
            vec![
                "Waiting for Subnet/s to be Created".to_string(),
                "Waiting for Network/n to be Ready".to_string()
            ]
        );
    }
}
