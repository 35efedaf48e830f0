//! Tag reconciliation
use crate::osclients::NetworkClient;
use orc_core::ReconcileStatus;
use orc_runtime::actuator;
use std::collections::BTreeSet;
use tracing::debug;

fn set(tags: &[String]) -> BTreeSet<&str> {
    tags.iter().map(String::as_str).collect()
}

/// Whether `observed` carries exactly the tags in `wanted`, ignoring order and repeats
pub fn in_sync(wanted: &[String], observed: &[String]) -> bool {
    set(wanted) == set(observed)
}

/// `tags` sorted and deduplicated
pub fn normalize(tags: &[String]) -> Vec<String> {
    set(tags).into_iter().map(str::to_string).collect()
}

/// Replace the tags of a Neutron resource when they differ from `wanted`
///
/// Neutron only offers replacing the whole set, so a single call brings the resource in line.
pub async fn sync_neutron(
    client: &dyn NetworkClient,
    resource_type: &str,
    id: &str,
    wanted: &[String],
    observed: &[String],
) -> ReconcileStatus {
    if in_sync(wanted, observed) {
        return ReconcileStatus::ok();
    }
    debug!(resource_type, id, ?wanted, ?observed, "replacing tags");
    match client.replace_tags(resource_type, id, &normalize(wanted)).await {
        Ok(_) => actuator::updated(),
        Err(err) => actuator::update_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osclients::{mock::MockCloud, Network};

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn comparison_ignores_order_and_repeats() {
        assert!(in_sync(&tags(&["a", "b"]), &tags(&["b", "a", "a"])));
        assert!(!in_sync(&tags(&["a"]), &tags(&["a", "b"])));
        assert_eq!(normalize(&tags(&["b", "a", "b"])), tags(&["a", "b"]));
    }

    #[tokio::test]
    async fn only_differing_tags_are_replaced() {
        let cloud = MockCloud::new();
        let id = cloud.insert_network(Network {
            tags: tags(&["b", "a"]),
            ..Network::default()
        });

        let status = sync_neutron(&cloud, "networks", &id, &tags(&["a", "b"]), &tags(&["b", "a"])).await;
        assert!(status.is_ok());
        assert_eq!(cloud.calls("replace_tags"), 0);

        let status = sync_neutron(&cloud, "networks", &id, &tags(&["c", "a"]), &tags(&["b", "a"])).await;
        assert!(status.is_refresh_only());
        assert_eq!(cloud.network(&id).unwrap().tags, tags(&["a", "c"]));
    }
}
