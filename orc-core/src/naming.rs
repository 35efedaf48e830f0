//! Finalizer and field manager names
//!
//! Every controller writes its objects under several field managers, one per transaction, so
//! that server-side apply never lets one transaction clear a field owned by another.

/// The API group shared by every resource and every finalizer
pub const GROUP: &str = "openstack.k-orc.cloud";

/// Transaction that writes `status`
pub const STATUS_TXN: &str = "status";

/// Transaction that adds and removes the controller's own finalizer
pub const FINALIZER_TXN: &str = "finalizer";

/// The finalizer a controller places on its own objects, and on the targets it guards
pub fn finalizer(controller: &str) -> String {
    format!("{GROUP}/{controller}")
}

/// The field manager used by `controller` for `txn`
pub fn field_owner(controller: &str, txn: &str) -> String {
    format!("{GROUP}/{controller}controller/{txn}")
}

/// The field manager a source controller uses when guarding objects of `target_kind`
pub fn guard_field_owner(controller: &str, target_kind: &str) -> String {
    field_owner(controller, &target_kind.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_scoped_by_controller() {
        assert_eq!(finalizer("subnet"), "openstack.k-orc.cloud/subnet");
        assert_eq!(
            field_owner("subnet", STATUS_TXN),
            "openstack.k-orc.cloud/subnetcontroller/status"
        );
        assert_eq!(
            guard_field_owner("subnet", "Network"),
            "openstack.k-orc.cloud/subnetcontroller/network"
        );
    }
}
