//! Watch caches.
//!
//! A [`Reflector`] keeps a [`Store`] in step with the cluster using list-then-watch,
//! falls back to a full relist whenever the watch breaks, and relists on a fixed resync
//! period to heal missed notifications. Every change it applies is published as one
//! tagged [`ResourceEvent`].

pub mod reflector;
pub mod store;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use reflector::Reflector;
pub use store::Store;

/// Change applied to a watch cache.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Becomes true once a cache has completed its first full list.
#[derive(Debug, Clone)]
pub struct SyncedSignal {
    name: &'static str,
    rx: watch::Receiver<bool>,
}

impl SyncedSignal {
    pub(crate) fn new(name: &'static str, rx: watch::Receiver<bool>) -> Self {
        Self { name, rx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn has_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until synced. Returns false if cancelled or the cache stopped first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.rx.clone();
        tokio::select! {
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

/// Block until every cache reports synced.
///
/// On failure returns the name of the first cache that never synced.
pub async fn wait_for_cache_sync(
    signals: &[SyncedSignal],
    cancel: &CancellationToken,
) -> std::result::Result<(), &'static str> {
    for signal in signals {
        if !signal.wait(cancel).await {
            return Err(signal.name());
        }
        tracing::debug!(cache = signal.name(), "Cache synced");
    }
    Ok(())
}
