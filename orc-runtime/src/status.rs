//! The `status` transaction
//!
//! Every reconcile pass which gets far enough to say something about the object ends with a
//! single server-side apply of the status subresource, under the controller's `status` field
//! manager. The patch always carries the full set of fields the controller owns, so fields the
//! controller stops reporting are released, and two passes observing the same state send the
//! same bytes.
//!
//! The only other status write is the merge patch recording `status.id` as soon as it is known,
//! before any further cloud call.
use crate::cluster::{self, Cluster, Object};
use chrono::Utc;
use kube::ResourceExt;
use orc_core::{
    conditions::{common_conditions, Availability, Condition},
    naming, ManagedObject, ReconcileStatus,
};
use serde_json::{json, Map, Value};
use tracing::trace;

/// Build the server-side apply patch for the status of `K`
pub fn status_patch<K: Object + ManagedObject>(
    id: Option<&str>,
    resource: Option<&K::ResourceStatus>,
    conditions: &[Condition],
) -> Result<Value, serde_json::Error> {
    let mut status = Map::new();
    if let Some(id) = id {
        status.insert("id".into(), json!(id));
    }
    if let Some(resource) = resource {
        status.insert("resource".into(), serde_json::to_value(resource)?);
    }
    status.insert("conditions".into(), serde_json::to_value(conditions)?);
    Ok(json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "status": status,
    }))
}

/// The merge patch recording `status.id`
pub fn id_patch(id: &str) -> Value {
    json!({ "status": { "id": id } })
}

/// Write the status of `obj` for the outcome of a pass
pub async fn write<K, C>(
    cluster: &C,
    controller: &str,
    obj: &K,
    id: Option<&str>,
    resource: Option<&K::ResourceStatus>,
    availability: Availability,
    outcome: &ReconcileStatus,
) -> Result<K, cluster::Error>
where
    K: Object + ManagedObject,
    C: Cluster,
{
    let conditions = common_conditions(
        obj.conditions(),
        obj.meta().generation,
        availability,
        outcome,
        Utc::now(),
    );
    let name = obj.name_any();
    let patch = status_patch::<K>(id, resource, &conditions)
        .map_err(|err| cluster::Error::Serialization(format!("status of {name}"), err))?;
    trace!(%patch, "applying status");
    cluster
        .apply_status::<K>(
            &obj.namespace().unwrap_or_default(),
            &name,
            &naming::field_owner(controller, naming::STATUS_TXN),
            &patch,
        )
        .await
}
