//! In-process cluster: one [`MemoryStore`] per resource kind sharing a single
//! resource version counter, the way an API server shares one storage revision.
//!
//! Besides serving the [`ResourceClient`] trait it offers hooks tests need:
//! failure injection per operation, forced watch disconnects, history compaction,
//! direct mutation (standing in for kubelet or a user), write counters, and
//! owner-reference garbage collection on JxTask deletion.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::api::{Event, JxTask, Lease, MetaExt, ObjectKey, Pod, PodExt, PodPhase, Resource};
use crate::client::{Clients, ObjectList, ResourceClient, WatchEvent, WatchStream};
use crate::error::{ControllerError, Result};

const DEFAULT_HISTORY_LIMIT: usize = 512;
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Client operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Watch,
    Get,
    Create,
    Replace,
    Delete,
}

struct Watcher<K> {
    namespace: String,
    tx: mpsc::Sender<WatchEvent<K>>,
}

struct StoreState<K> {
    objects: BTreeMap<ObjectKey, K>,
    history: VecDeque<(u64, WatchEvent<K>)>,
    /// Highest version no longer present in `history`.
    compacted: u64,
    watchers: Vec<Watcher<K>>,
    failures: HashMap<Op, u32>,
    forced_conflicts: u32,
    writes: u64,
}

/// Versioned object store for one resource kind.
pub struct MemoryStore<K: Resource> {
    state: Mutex<StoreState<K>>,
    revision: Arc<AtomicU64>,
    history_limit: usize,
}

impl<K: Resource> MemoryStore<K> {
    pub fn new(revision: Arc<AtomicU64>) -> Self {
        Self::with_history_limit(revision, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(revision: Arc<AtomicU64>, history_limit: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                compacted: 0,
                watchers: Vec::new(),
                failures: HashMap::new(),
                forced_conflicts: 0,
                writes: 0,
            }),
            revision,
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make the next `count` calls of `op` fail with a transient API error.
    pub fn fail_next(&self, op: Op, count: u32) {
        *self.lock().failures.entry(op).or_insert(0) += count;
    }

    /// Make the next `count` replaces fail with `Conflict` regardless of version.
    pub fn conflict_next_replaces(&self, count: u32) {
        self.lock().forced_conflicts += count;
    }

    /// Drop every open watch, as a server restart or network blip would.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Discard all watch history so resuming from any older version fails.
    pub fn compact(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.compacted = self.revision.load(Ordering::SeqCst);
    }

    /// Number of successful create/replace/delete calls made through the client trait.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    pub fn snapshot(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn get_object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    /// Apply `f` to the stored object outside the client path (no write counted).
    pub fn mutate<F>(&self, key: &ObjectKey, f: F) -> Result<K>
    where
        F: FnOnce(&mut K),
    {
        let mut state = self.lock();
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| not_found::<K>(key))?;
        f(&mut obj);
        obj.set_revision(self.next_revision());
        state.objects.insert(key.clone(), obj.clone());
        self.record(&mut state, WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    /// Insert an object outside the client path (no write counted).
    pub fn insert(&self, obj: K) -> Result<K> {
        let mut state = self.lock();
        self.insert_locked(&mut state, obj)
    }

    /// Remove an object outside the client path (no write counted).
    pub fn remove(&self, key: &ObjectKey) -> Result<K> {
        let mut state = self.lock();
        self.remove_locked(&mut state, key)
    }

    fn check_failure(state: &mut StoreState<K>, op: Op) -> Result<()> {
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ControllerError::Api(format!(
                    "injected {op:?} failure for {}",
                    K::KIND
                )));
            }
        }
        Ok(())
    }

    fn insert_locked(&self, state: &mut StoreState<K>, mut obj: K) -> Result<K> {
        let key = obj.key();
        if state.objects.contains_key(&key) {
            return Err(ControllerError::AlreadyExists {
                kind: K::KIND,
                key: key.to_string(),
            });
        }
        let meta = obj.meta_mut();
        if meta.uid_str().is_empty() {
            meta.uid = Some(Uuid::new_v4().to_string());
        }
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        obj.set_revision(self.next_revision());
        state.objects.insert(key, obj.clone());
        self.record(state, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    fn remove_locked(&self, state: &mut StoreState<K>, key: &ObjectKey) -> Result<K> {
        let mut obj = state
            .objects
            .remove(key)
            .ok_or_else(|| not_found::<K>(key))?;
        obj.set_revision(self.next_revision());
        self.record(state, WatchEvent::Deleted(obj.clone()));
        Ok(obj)
    }

    /// Append to history and fan out to watchers. Watchers that are gone or too slow
    /// to keep up are dropped, which closes their stream.
    fn record(&self, state: &mut StoreState<K>, event: WatchEvent<K>) {
        let version = event.object().revision();
        let namespace = event.object().meta().namespace_str().to_string();

        state
            .watchers
            .retain(|w| !in_namespace(&w.namespace, &namespace) || w.tx.try_send(event.clone()).is_ok());

        state.history.push_back((version, event));
        while state.history.len() > self.history_limit {
            if let Some((evicted, _)) = state.history.pop_front() {
                state.compacted = evicted;
            }
        }
    }
}

fn in_namespace(filter: &str, namespace: &str) -> bool {
    filter.is_empty() || filter == namespace
}

fn not_found<K: Resource>(key: &ObjectKey) -> ControllerError {
    ControllerError::NotFound {
        kind: K::KIND,
        key: key.to_string(),
    }
}

#[async_trait]
impl<K: Resource> ResourceClient<K> for MemoryStore<K> {
    async fn list(&self, namespace: &str) -> Result<ObjectList<K>> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::List)?;
        let items = state
            .objects
            .values()
            .filter(|o| in_namespace(namespace, o.meta().namespace_str()))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: self.revision.load(Ordering::SeqCst),
        })
    }

    async fn watch(&self, namespace: &str, resource_version: u64) -> Result<WatchStream<K>> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::Watch)?;
        if resource_version < state.compacted {
            return Err(ControllerError::Expired(resource_version));
        }

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        for (version, event) in &state.history {
            if *version > resource_version
                && in_namespace(namespace, event.object().meta().namespace_str())
                && tx.try_send(event.clone()).is_err()
            {
                return Err(ControllerError::Expired(resource_version));
            }
        }
        state.watchers.push(Watcher {
            namespace: namespace.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn get(&self, key: &ObjectKey) -> Result<K> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::Get)?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| not_found::<K>(key))
    }

    async fn create(&self, obj: K) -> Result<K> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::Create)?;
        let created = self.insert_locked(&mut state, obj)?;
        state.writes += 1;
        Ok(created)
    }

    async fn replace(&self, mut obj: K) -> Result<K> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::Replace)?;
        let key = obj.key();
        let (current_version, uid, created) = {
            let current = state
                .objects
                .get(&key)
                .ok_or_else(|| not_found::<K>(&key))?;
            (
                current.revision(),
                current.meta().uid.clone(),
                current.meta().creation_timestamp.clone(),
            )
        };

        let expected = obj.revision();
        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            return Err(ControllerError::Conflict {
                kind: K::KIND,
                key: key.to_string(),
                expected,
            });
        }
        if expected != 0 && expected != current_version {
            return Err(ControllerError::Conflict {
                kind: K::KIND,
                key: key.to_string(),
                expected,
            });
        }

        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.creation_timestamp = created;
        obj.set_revision(self.next_revision());

        state.objects.insert(key, obj.clone());
        self.record(&mut state, WatchEvent::Modified(obj.clone()));
        state.writes += 1;
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        Self::check_failure(&mut state, Op::Delete)?;
        self.remove_locked(&mut state, key)?;
        state.writes += 1;
        Ok(())
    }
}

/// A whole in-memory cluster: JxTasks, Pods, Leases and Events.
#[derive(Clone)]
pub struct MemoryCluster {
    pub jxtasks: Arc<MemoryStore<JxTask>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub leases: Arc<MemoryStore<Lease>>,
    pub events: Arc<MemoryStore<Event>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let revision = Arc::new(AtomicU64::new(0));
        Self {
            jxtasks: Arc::new(MemoryStore::new(revision.clone())),
            pods: Arc::new(MemoryStore::new(revision.clone())),
            leases: Arc::new(MemoryStore::new(revision.clone())),
            events: Arc::new(MemoryStore::new(revision)),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            jxtasks: self.jxtasks.clone(),
            pods: self.pods.clone(),
            leases: self.leases.clone(),
            events: self.events.clone(),
        }
    }

    /// Delete a JxTask and garbage-collect the pods it controls, as the cluster's
    /// owner-reference collector would.
    pub fn delete_jxtask(&self, key: &ObjectKey) -> Result<Vec<ObjectKey>> {
        let removed = self.jxtasks.remove(key)?;
        let uid = removed.metadata.uid_str();

        let owned: Vec<ObjectKey> = self
            .pods
            .snapshot()
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .controller_ref()
                    .is_some_and(|owner| owner.uid == uid)
            })
            .map(|pod| pod.key())
            .collect();

        for pod in &owned {
            // Already gone is fine, the collector is best effort.
            let _ = self.pods.remove(pod);
        }
        tracing::debug!(jxtask = %key, pods = owned.len(), "Garbage collected owned pods");
        Ok(owned)
    }

    /// Set a pod's phase, standing in for the kubelet.
    pub fn set_pod_phase(&self, key: &ObjectKey, phase: PodPhase) -> Result<Pod> {
        self.pods.mutate(key, |pod| pod.set_phase(phase))
    }

    /// Set the phase of every pod controlled by the JxTask with `uid`.
    pub fn set_owned_pod_phases(&self, uid: &str, phase: PodPhase) -> usize {
        let keys: Vec<ObjectKey> = self
            .pods
            .snapshot()
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .controller_ref()
                    .is_some_and(|owner| owner.uid == uid)
            })
            .map(|pod| pod.key())
            .collect();
        keys.iter()
            .filter(|key| self.set_pod_phase(key, phase).is_ok())
            .count()
    }
}
