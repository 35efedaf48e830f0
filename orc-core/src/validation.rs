//! Checks on the common spec layout
//!
//! These are the rules an admission webhook would enforce. The reconciler runs them before
//! touching OpenStack so that an object which slipped past admission fails terminally instead
//! of creating something unintended.
use crate::{ConditionReason, Error, ImportFilter, ManagedObject, ManagementPolicy};

fn invalid(message: &str) -> Error {
    Error::terminal(ConditionReason::InvalidConfiguration, message)
}

/// Validate the management policy against `resource`, `import` and `managedOptions`
pub fn validate<K: ManagedObject>(obj: &K) -> Result<(), Error> {
    let has_resource = obj.resource_spec().is_some();
    let import = obj.import();

    if has_resource == import.is_some() {
        return Err(invalid("exactly one of resource or import must be specified"));
    }

    match obj.management_policy() {
        ManagementPolicy::Managed if !has_resource => {
            return Err(invalid("resource must be specified when policy is managed"));
        }
        ManagementPolicy::Unmanaged if import.is_none() => {
            return Err(invalid("import must be specified when policy is unmanaged"));
        }
        ManagementPolicy::Unmanaged if obj.managed_options().is_some() => {
            return Err(invalid("managedOptions may only be provided when policy is managed"));
        }
        _ => {}
    }

    if let Some(import) = import {
        match (&import.id, &import.filter) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(invalid("exactly one of import.id or import.filter must be specified"));
            }
            (Some(id), None) if id.is_empty() => return Err(invalid("import.id must not be empty")),
            (None, Some(filter)) if filter.is_empty() => {
                return Err(invalid("import.filter must specify at least one field"));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::tests::widget;

    fn check(spec: &str) -> Result<(), String> {
        let w = widget(&format!(
            "apiVersion: test.k-orc.cloud/v1alpha1\nkind: Widget\nmetadata: {{name: w, namespace: ns}}\nspec: {spec}\n"
        ));
        validate(&w).map_err(|e| {
            assert_eq!(e.reason(), ConditionReason::InvalidConfiguration);
            e.to_string()
        })
    }

    #[test]
    fn accepts_the_two_valid_shapes() {
        assert!(check("{managementPolicy: managed, resource: {}}").is_ok());
        assert!(check("{managementPolicy: managed, managedOptions: {onDelete: detach}, resource: {}}").is_ok());
        assert!(check("{managementPolicy: unmanaged, import: {id: abc}}").is_ok());
        assert!(check("{managementPolicy: unmanaged, import: {filter: {name: x}}}").is_ok());
    }

    #[test]
    fn rejects_mismatched_policy() {
        assert_eq!(
            check("{managementPolicy: unmanaged, resource: {}}").unwrap_err(),
            "import must be specified when policy is unmanaged"
        );
        assert_eq!(
            check("{managementPolicy: managed, import: {id: abc}}").unwrap_err(),
            "resource must be specified when policy is managed"
        );
        assert!(check("{managementPolicy: managed}").is_err());
        assert!(check("{managementPolicy: managed, resource: {}, import: {id: abc}}").is_err());
        assert!(check("{managementPolicy: unmanaged, managedOptions: {}, import: {id: a}}").is_err());
    }

    #[test]
    fn rejects_empty_imports() {
        assert!(check("{managementPolicy: unmanaged, import: {}}").is_err());
        assert!(check("{managementPolicy: unmanaged, import: {filter: {}}}").is_err());
        assert!(check("{managementPolicy: unmanaged, import: {id: a, filter: {name: x}}}").is_err());
    }
}
