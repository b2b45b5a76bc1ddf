//! Resource types the controller reads and writes.
//!
//! - [`JxTask`]: the custom workload resource (`jiaxuan.org/v1alpha1`)
//! - [`Pod`]: the owned resource, created and deleted by the reconciler
//! - [`Lease`]: the coordination record used for leader election
//! - [`Event`]: what the controller reports about the objects it manages
//!
//! Pods, leases and events are the upstream `k8s-openapi` types. Every kind
//! implements [`Resource`] so the cluster client, watch caches and status writer can
//! be written once and shared by all of them.

pub mod jxtask;
pub mod lease;
pub mod pod;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use jxtask::{
    ChiefSpec, JxTask, JxTaskSpec, JxTaskStatus, Phase, State, Task, TaskState, TaskStateCounts,
    TaskStatus, TaskType, TerminationPolicy,
};
pub use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
pub use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Event, EventSource, HostPathVolumeSource, ObjectReference,
    Pod, PodSpec, PodStatus, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
pub use lease::LeaseExt;
pub use pod::{PodExt, PodPhase};

/// Namespace + name identity of a namespaced object. Also the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` string. A bare name lands in `default_namespace`.
    pub fn parse(s: &str, default_namespace: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some(Self::new(ns, name))
            }
            Some(_) => None,
            None if !s.is_empty() => Some(Self::new(default_namespace, s)),
            None => None,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Borrowing accessors over the optional fields of [`ObjectMeta`].
pub trait MetaExt {
    fn name_str(&self) -> &str;

    fn namespace_str(&self) -> &str;

    /// Empty until the cluster assigns one on create.
    fn uid_str(&self) -> &str;

    fn label(&self, key: &str) -> Option<&str>;

    /// The owner reference flagged as the managing controller, if any.
    fn controller_ref(&self) -> Option<&OwnerReference>;
}

impl MetaExt for ObjectMeta {
    fn name_str(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    fn namespace_str(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    fn uid_str(&self) -> &str {
        self.uid.as_deref().unwrap_or_default()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }

    fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .flatten()
            .find(|r| r.controller == Some(true))
    }
}

/// Common surface of every resource kind the controller handles.
///
/// Metadata access comes from [`kube::Resource`]. This adds the kind name used in
/// errors and logs, the cache key, and the resource version read as the ordered
/// counter the in-memory cluster assigns.
pub trait Resource:
    kube::Resource<DynamicType = ()> + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
    const KIND: &'static str;

    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(meta.namespace_str(), meta.name_str())
    }

    /// Unset or unparsable versions read as 0, which means "unconditional" on replace.
    fn revision(&self) -> u64 {
        self.meta()
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn set_revision(&mut self, revision: u64) {
        self.meta_mut().resource_version = Some(revision.to_string());
    }
}

impl Resource for JxTask {
    const KIND: &'static str = jxtask::KIND;
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";
}

impl Resource for Lease {
    const KIND: &'static str = "Lease";
}

impl Resource for Event {
    const KIND: &'static str = "Event";
}

/// Metadata for a new namespaced object.
pub fn object_meta(namespace: impl Into<String>, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace.into()),
        ..Default::default()
    }
}
