use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::Resource;
use crate::cache::{ResourceEvent, Store, SyncedSignal};
use crate::client::{ResourceClient, WatchEvent};
use crate::error::{ControllerError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Keeps a [`Store`] in sync with one resource kind.
pub struct Reflector<K: Resource> {
    client: Arc<dyn ResourceClient<K>>,
    namespace: String,
    resync_period: Duration,
    retry_backoff: Duration,
    store: Store<K>,
    events_tx: mpsc::Sender<ResourceEvent<K>>,
    synced_tx: watch::Sender<bool>,
    synced: SyncedSignal,
}

impl<K: Resource> Reflector<K> {
    /// Create a reflector and the receiving end of its change stream.
    pub fn new(
        client: Arc<dyn ResourceClient<K>>,
        namespace: impl Into<String>,
        resync_period: Duration,
    ) -> (Self, mpsc::Receiver<ResourceEvent<K>>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (synced_tx, synced_rx) = watch::channel(false);

        let reflector = Self {
            client,
            namespace: namespace.into(),
            resync_period,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            store: Store::new(),
            events_tx,
            synced_tx,
            synced: SyncedSignal::new(K::KIND, synced_rx),
        };

        (reflector, events_rx)
    }

    /// Delay before retrying a failed list or watch call.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    pub fn synced(&self) -> SyncedSignal {
        self.synced.clone()
    }

    /// Run list-then-watch until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let kind = K::KIND;
        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'relist: loop {
            if cancel.is_cancelled() {
                break;
            }

            let version = match self.relist().await {
                Ok(version) => version,
                Err(e) => {
                    tracing::warn!(kind, error = %e, "List failed, retrying");
                    if self.pause(&cancel).await {
                        continue 'relist;
                    }
                    break;
                }
            };

            let mut stream = match self.client.watch(&self.namespace, version).await {
                Ok(stream) => stream,
                Err(ControllerError::Expired(v)) => {
                    tracing::info!(kind, resource_version = v, "Watch version expired, relisting");
                    continue 'relist;
                }
                Err(e) => {
                    tracing::warn!(kind, error = %e, "Watch failed, relisting");
                    if self.pause(&cancel).await {
                        continue 'relist;
                    }
                    break;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'relist,
                    _ = resync.tick() => {
                        tracing::debug!(kind, "Resync period elapsed, relisting");
                        continue 'relist;
                    }
                    event = stream.recv() => match event {
                        Some(event) => self.apply(event).await,
                        None => {
                            tracing::info!(kind, "Watch closed, relisting");
                            continue 'relist;
                        }
                    }
                }
            }
        }

        tracing::debug!(kind, "Reflector stopped");
    }

    /// Full list into the store. Returns the version to watch from.
    async fn relist(&self) -> Result<u64> {
        let list = self.client.list(&self.namespace).await?;
        let count = list.items.len();
        for event in self.store.replace(list.items) {
            self.publish(event).await;
        }

        if !*self.synced_tx.borrow() {
            tracing::info!(kind = K::KIND, objects = count, "Initial list complete, cache synced");
        }
        self.synced_tx.send_replace(true);
        Ok(list.resource_version)
    }

    async fn apply(&self, event: WatchEvent<K>) {
        let change = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.store.upsert(obj),
            WatchEvent::Deleted(obj) => self.store.remove(obj),
        };
        if let Some(change) = change {
            self.publish(change).await;
        }
    }

    async fn publish(&self, event: ResourceEvent<K>) {
        // Nobody listening is fine, the store is still kept current.
        let _ = self.events_tx.send(event).await;
    }

    /// Sleep for the retry backoff. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
