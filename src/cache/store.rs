use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::api::{ObjectKey, Resource};
use crate::cache::ResourceEvent;

/// Read-only mirror of one resource kind.
///
/// Readers get `Arc` snapshots of individual objects and never hold the lock across an
/// await. The only writer is the owning [`Reflector`](crate::cache::Reflector).
#[derive(Debug)]
pub struct Store<K> {
    objects: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
        }
    }
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of the objects matching `pred`.
    pub fn filter<F>(&self, pred: F) -> Vec<Arc<K>>
    where
        F: Fn(&K) -> bool,
    {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|obj| pred(obj))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply one watch change. Returns the event to publish, or `None` when the change
    /// is older than what the store already holds.
    pub(crate) fn upsert(&self, obj: K) -> Option<ResourceEvent<K>> {
        let key = obj.key();
        let new = Arc::new(obj);
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match objects.get(&key) {
            Some(old) if old.revision() >= new.revision() => None,
            Some(old) => {
                let old = old.clone();
                objects.insert(key, new.clone());
                Some(ResourceEvent::Updated { old, new })
            }
            None => {
                objects.insert(key, new.clone());
                Some(ResourceEvent::Added(new))
            }
        }
    }

    pub(crate) fn remove(&self, obj: K) -> Option<ResourceEvent<K>> {
        let key = obj.key();
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .map(|_| ResourceEvent::Deleted(Arc::new(obj)))
    }

    /// Swap in the result of a full list.
    ///
    /// Every object still present is reported as `Updated` (even when unchanged) so a
    /// relist doubles as a periodic resync; new objects are `Added` and vanished ones
    /// `Deleted`.
    pub(crate) fn replace(&self, items: Vec<K>) -> Vec<ResourceEvent<K>> {
        let mut fresh: HashMap<ObjectKey, Arc<K>> = items
            .into_iter()
            .map(|obj| (obj.key(), Arc::new(obj)))
            .collect();

        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::with_capacity(fresh.len());

        for (key, old) in objects.iter() {
            match fresh.get(key) {
                Some(new) => events.push(ResourceEvent::Updated {
                    old: old.clone(),
                    new: new.clone(),
                }),
                None => events.push(ResourceEvent::Deleted(old.clone())),
            }
        }
        for (key, new) in &fresh {
            if !objects.contains_key(key) {
                events.push(ResourceEvent::Added(new.clone()));
            }
        }

        std::mem::swap(&mut *objects, &mut fresh);
        events
    }
}
