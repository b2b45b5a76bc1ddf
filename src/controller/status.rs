use std::sync::Arc;

use crate::api::{JxTask, JxTaskStatus, ObjectKey};
use crate::client::ResourceClient;
use crate::error::{ControllerError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Outcome of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The stored status already matched.
    Unchanged,
    /// The JxTask is gone.
    Deleted,
    /// The stored phase is ahead of the one being written.
    Stale,
}

/// Persists JxTask status with optimistic concurrency.
///
/// Each attempt fetches the latest object, so a conflict is retried immediately
/// against fresh data. No backoff between attempts.
#[derive(Clone)]
pub struct StatusWriter {
    client: Arc<dyn ResourceClient<JxTask>>,
    max_attempts: u32,
}

impl StatusWriter {
    pub fn new(client: Arc<dyn ResourceClient<JxTask>>) -> Self {
        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub async fn write(&self, key: &ObjectKey, status: &JxTaskStatus) -> Result<WriteOutcome> {
        for attempt in 1..=self.max_attempts {
            let mut latest = match self.client.get(key).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(jxtask = %key, "JxTask deleted before status write");
                    return Ok(WriteOutcome::Deleted);
                }
                Err(e) => return Err(e),
            };

            if latest.status.as_ref() == Some(status) {
                return Ok(WriteOutcome::Unchanged);
            }
            if !latest.phase().can_transition_to(status.phase) {
                tracing::warn!(
                    jxtask = %key,
                    stored = %latest.phase(),
                    wanted = %status.phase,
                    "Refusing to move phase backwards"
                );
                return Ok(WriteOutcome::Stale);
            }

            latest.status = Some(status.clone());
            match self.client.replace(latest).await {
                Ok(_) => {
                    tracing::debug!(jxtask = %key, phase = %status.phase, attempt, "Status written");
                    return Ok(WriteOutcome::Written);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(jxtask = %key, attempt, "Status write conflicted, refetching");
                }
                Err(e) if e.is_not_found() => return Ok(WriteOutcome::Deleted),
                Err(e) => return Err(e),
            }
        }

        Err(ControllerError::ConflictRetriesExhausted {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{JxTaskSpec, Phase, Resource, State};
    use crate::client::{MemoryCluster, Op};

    fn setup() -> (MemoryCluster, StatusWriter, ObjectKey) {
        let cluster = MemoryCluster::new();
        let obj = cluster
            .jxtasks
            .insert(JxTask::namespaced("default", "train", JxTaskSpec::default()))
            .unwrap();
        let writer = StatusWriter::new(cluster.jxtasks.clone());
        (cluster, writer, obj.key())
    }

    fn creating() -> JxTaskStatus {
        JxTaskStatus {
            phase: Phase::Creating,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_then_skips_equal_status() {
        let (cluster, writer, key) = setup();
        assert_eq!(writer.write(&key, &creating()).await.unwrap(), WriteOutcome::Written);
        assert_eq!(cluster.jxtasks.write_count(), 1);

        assert_eq!(writer.write(&key, &creating()).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(cluster.jxtasks.write_count(), 1);
        assert_eq!(cluster.jxtasks.get_object(&key).unwrap().phase(), Phase::Creating);
    }

    #[tokio::test]
    async fn retries_conflicts() {
        let (cluster, writer, key) = setup();
        cluster.jxtasks.conflict_next_replaces(4);
        assert_eq!(writer.write(&key, &creating()).await.unwrap(), WriteOutcome::Written);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (cluster, writer, key) = setup();
        cluster.jxtasks.conflict_next_replaces(5);
        let err = writer.write(&key, &creating()).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::ConflictRetriesExhausted { attempts: 5, .. }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn deleted_object_is_not_an_error() {
        let (cluster, writer, key) = setup();
        cluster.delete_jxtask(&key).unwrap();
        assert_eq!(writer.write(&key, &creating()).await.unwrap(), WriteOutcome::Deleted);
    }

    #[tokio::test]
    async fn transient_get_failure_surfaces() {
        let (cluster, writer, key) = setup();
        cluster.jxtasks.fail_next(Op::Get, 1);
        assert!(writer.write(&key, &creating()).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn terminal_phase_is_never_overwritten() {
        let (cluster, writer, key) = setup();
        let done = JxTaskStatus {
            phase: Phase::Done,
            state: State::Succeeded,
            ..Default::default()
        };
        writer.write(&key, &done).await.unwrap();
        assert_eq!(writer.write(&key, &creating()).await.unwrap(), WriteOutcome::Stale);
        assert_eq!(cluster.jxtasks.get_object(&key).unwrap().phase(), Phase::Done);
    }
}
