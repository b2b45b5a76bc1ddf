use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::jxtask::KIND as JXTASK_KIND;
use crate::api::{JxTask, MetaExt, ObjectKey, Pod, Resource};
use crate::cache::ResourceEvent;
use crate::controller::queue::WorkQueue;

/// Key of the JxTask controlling `pod`, if any.
pub fn owner_key(pod: &Pod) -> Option<ObjectKey> {
    let owner = pod.metadata.controller_ref()?;
    if owner.kind != JXTASK_KIND {
        return None;
    }
    Some(ObjectKey::new(pod.metadata.namespace_str(), owner.name.clone()))
}

/// Every JxTask change, periodic resyncs included, queues that JxTask.
pub fn jxtask_keys(event: &ResourceEvent<JxTask>) -> Vec<ObjectKey> {
    match event {
        ResourceEvent::Added(obj) | ResourceEvent::Deleted(obj) => vec![obj.key()],
        ResourceEvent::Updated { new, .. } => vec![new.key()],
    }
}

/// Pod changes queue the owning JxTask. Updates that carry no new version are
/// skipped; a pod that changed owner queues both owners.
pub fn pod_keys(event: &ResourceEvent<Pod>) -> Vec<ObjectKey> {
    match event {
        ResourceEvent::Added(pod) | ResourceEvent::Deleted(pod) => {
            owner_key(pod).into_iter().collect()
        }
        ResourceEvent::Updated { old, new } => {
            if old.revision() == new.revision() {
                return Vec::new();
            }
            let mut keys: Vec<ObjectKey> = owner_key(new).into_iter().collect();
            if let Some(previous) = owner_key(old) {
                if !keys.contains(&previous) {
                    keys.push(previous);
                }
            }
            keys
        }
    }
}

/// Feeds both cache change streams into the work queue until cancelled or both
/// streams end.
pub async fn route_events(
    mut jxtask_events: mpsc::Receiver<ResourceEvent<JxTask>>,
    mut pod_events: mpsc::Receiver<ResourceEvent<Pod>>,
    queue: WorkQueue<ObjectKey>,
    cancel: CancellationToken,
) {
    let mut jxtasks_open = true;
    let mut pods_open = true;

    while jxtasks_open || pods_open {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = jxtask_events.recv(), if jxtasks_open => match event {
                Some(event) => {
                    for key in jxtask_keys(&event) {
                        tracing::trace!(jxtask = %key, "JxTask changed");
                        queue.add(key);
                    }
                }
                None => jxtasks_open = false,
            },
            event = pod_events.recv(), if pods_open => match event {
                Some(event) => {
                    for key in pod_keys(&event) {
                        tracing::trace!(jxtask = %key, "Owned pod changed");
                        queue.add(key);
                    }
                }
                None => pods_open = false,
            },
        }
    }

    tracing::debug!("Event router stopped");
}
