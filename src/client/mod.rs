//! Cluster API client seam.
//!
//! The controller only talks to the cluster through [`ResourceClient`]: list, watch,
//! get, create, replace (conditional on resource version) and delete. A transport to a
//! real API server implements this trait; [`memory::MemoryCluster`] is the in-process
//! implementation used by the test suite and the binary's standalone mode.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{Event, JxTask, Lease, ObjectKey, Pod, Resource};
use crate::error::Result;

pub use memory::{MemoryCluster, MemoryStore, Op};

/// Result of a full list: the objects plus the version to resume watching from.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: u64,
}

/// One change notification from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K: Resource> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// A watch is a channel of events. The server closing it means "relist".
pub type WatchStream<K> = mpsc::Receiver<WatchEvent<K>>;

#[async_trait]
pub trait ResourceClient<K: Resource>: Send + Sync {
    /// List every object in `namespace` (all namespaces when empty).
    async fn list(&self, namespace: &str) -> Result<ObjectList<K>>;

    /// Stream changes after `resource_version`.
    ///
    /// Fails with [`ControllerError::Expired`](crate::error::ControllerError::Expired)
    /// when the requested version has been compacted away.
    async fn watch(&self, namespace: &str, resource_version: u64) -> Result<WatchStream<K>>;

    async fn get(&self, key: &ObjectKey) -> Result<K>;

    async fn create(&self, obj: K) -> Result<K>;

    /// Replace the stored object. A non-zero resource version on `obj` must match the
    /// stored one, otherwise the write fails with `Conflict`.
    async fn replace(&self, obj: K) -> Result<K>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Typed clients for every kind the controller touches.
#[derive(Clone)]
pub struct Clients {
    pub jxtasks: Arc<dyn ResourceClient<JxTask>>,
    pub pods: Arc<dyn ResourceClient<Pod>>,
    pub leases: Arc<dyn ResourceClient<Lease>>,
    pub events: Arc<dyn ResourceClient<Event>>,
}
