use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};

use crate::api::object_meta;

/// Leader election view of a [`Lease`]. Whoever holds it runs the workers.
pub trait LeaseExt {
    fn with_spec(namespace: &str, name: &str, spec: LeaseSpec) -> Self;

    /// The current holder. An empty identity counts as released.
    fn holder(&self) -> Option<&str>;

    fn transitions(&self) -> i32;
}

impl LeaseExt for Lease {
    fn with_spec(namespace: &str, name: &str, spec: LeaseSpec) -> Self {
        Lease {
            metadata: object_meta(namespace, name),
            spec: Some(spec),
        }
    }

    fn holder(&self) -> Option<&str> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref())
            .filter(|holder| !holder.is_empty())
    }

    fn transitions(&self) -> i32 {
        self.spec
            .as_ref()
            .and_then(|spec| spec.lease_transitions)
            .unwrap_or(0)
    }
}
