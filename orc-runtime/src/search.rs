//! Uniqueness checks on adoption and import searches
use futures::{Stream, StreamExt};
use orc_core::{CloudError, ConditionReason, ReconcileStatus};

/// The outcome of a search which must match at most one resource
#[derive(Debug, PartialEq, Eq)]
pub enum Match<R> {
    None,
    One(R),
    /// More than one resource matched
    Many,
}

/// Drain `results` far enough to decide whether it holds zero, one or several resources
///
/// Stops reading after the second match, so an unbounded listing costs at most two items.
pub async fn at_most_one<R, S>(results: S) -> Result<Match<R>, CloudError>
where
    S: Stream<Item = Result<R, CloudError>> + Unpin,
{
    let mut results = results;
    let first = match results.next().await {
        None => return Ok(Match::None),
        Some(item) => item?,
    };
    match results.next().await {
        None => Ok(Match::One(first)),
        Some(item) => {
            item?;
            Ok(Match::Many)
        }
    }
}

/// The terminal status for a search which matched several resources
pub fn duplicate(what: &str) -> ReconcileStatus {
    ReconcileStatus::terminal(
        ConditionReason::DuplicateResource,
        format!("found more than one matching OpenStack resource during {what}"),
    )
}
