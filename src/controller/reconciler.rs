//! The JxTask state machine.
//!
//! One pass over a key:
//! 1. read the JxTask from the cache (gone means nothing to do)
//! 2. reject invalid specs with a terminal `Failed` status
//! 3. per task, create missing replica pods and delete surplus ones
//! 4. fold the observed pod phases into per-task status
//! 5. apply the termination policy, cleaning up live pods once the outcome is known
//! 6. write the status if it changed
//!
//! Phases only move forward: `None -> Creating -> Running -> CleanUp -> Done | Failed`.
//! The outcome is stored together with `CleanUp`, so a pass that resumes clean-up
//! does not depend on the pods that decided it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::api::{
    JxTask, JxTaskStatus, MetaExt, ObjectKey, Phase, Pod, PodExt, PodPhase, Resource, State,
    Task, TaskState, TaskStateCounts, TaskStatus,
};
use crate::cache::Store;
use crate::client::Clients;
use crate::config::Accelerators;
use crate::controller::pods;
use crate::controller::recorder::{self, EventRecorder};
use crate::controller::status::{StatusWriter, WriteOutcome};
use crate::error::{ControllerError, Result};

pub struct Reconciler {
    jxtasks: Store<JxTask>,
    pods: Store<Pod>,
    clients: Clients,
    status: StatusWriter,
    recorder: EventRecorder,
    failure_tolerance: u32,
    accelerators: Accelerators,
    /// uid of every JxTask this process moved to a terminal phase. The JxTask cache can
    /// lag behind the pod cache, so a stale non-terminal copy must not restart pods.
    finished: Mutex<HashMap<ObjectKey, String>>,
}

/// Pods of one task, split by whether their index is wanted.
struct TaskPods {
    by_index: HashMap<i32, Arc<Pod>>,
    surplus: Vec<Arc<Pod>>,
}

impl Reconciler {
    pub fn new(
        jxtasks: Store<JxTask>,
        pods: Store<Pod>,
        clients: Clients,
        failure_tolerance: u32,
    ) -> Self {
        let status = StatusWriter::new(clients.jxtasks.clone());
        let recorder = EventRecorder::new(clients.events.clone(), recorder::COMPONENT);
        Self {
            jxtasks,
            pods,
            clients,
            status,
            recorder,
            failure_tolerance,
            accelerators: Accelerators::new(),
            finished: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_status_writer(mut self, status: StatusWriter) -> Self {
        self.status = status;
        self
    }

    pub fn with_accelerators(mut self, accelerators: Accelerators) -> Self {
        self.accelerators = accelerators;
        self
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(jxtask) = self.jxtasks.get(key) else {
            tracing::debug!(jxtask = %key, "JxTask not in cache, nothing to do");
            self.forget_finished(key);
            return Ok(());
        };

        let mut status = jxtask.current_status();
        if status.phase.is_terminal() {
            return Ok(());
        }
        if self.is_finished(key, jxtask.metadata.uid_str()) {
            tracing::debug!(jxtask = %key, "Cached JxTask lags a terminal status write, skipping");
            return Ok(());
        }

        if let Err(e) = jxtask.spec.validate() {
            return self.fail(key, &jxtask, &status, e).await;
        }

        if status.phase == Phase::None {
            tracing::info!(jxtask = %key, tasks = jxtask.spec.tasks.len(), "New JxTask, creating pods");
            status.phase = Phase::Creating;
            status.task_statuses = jxtask.spec.tasks.iter().map(TaskStatus::placeholder).collect();
        }

        let mut observed: HashMap<&str, TaskPods> = HashMap::new();
        for task in &jxtask.spec.tasks {
            observed.insert(task.name.as_str(), self.observe(&jxtask, task));
        }

        let mut all_observed = true;
        if status.phase != Phase::CleanUp {
            let cluster = pods::cluster_spec(&jxtask)?;
            for task in &jxtask.spec.tasks {
                let Some(task_pods) = observed.get(task.name.as_str()) else {
                    continue;
                };
                match self.sync_task(key, &jxtask, task, task_pods, &cluster).await {
                    Ok(complete) => all_observed &= complete,
                    Err(e @ ControllerError::PodNameTaken { .. }) => {
                        return self.fail(key, &jxtask, &status, e).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        status.task_statuses = jxtask
            .spec
            .tasks
            .iter()
            .map(|task| {
                let by_index = observed.get(task.name.as_str()).map(|p| &p.by_index);
                self.task_status(task, by_index)
            })
            .collect();

        let outcome = match status.phase {
            // Decided when clean-up began. Anything but success counts as failure.
            Phase::CleanUp => Some(match status.state {
                State::Succeeded => State::Succeeded,
                _ => State::Failed,
            }),
            _ => self.outcome(&jxtask, &status, &observed),
        };

        match outcome {
            Some(state) => {
                if status.phase != Phase::CleanUp {
                    tracing::info!(jxtask = %key, outcome = %state, "JxTask finished, cleaning up");
                    status.phase = Phase::CleanUp;
                    status.state = state;
                    status.reason = outcome_reason(state).to_string();
                }
                if let Err(e) = self.clean_up(key, &jxtask).await {
                    // Persist CleanUp with its outcome so the retry resumes from there.
                    self.write_status(key, &jxtask, &status).await?;
                    return Err(e);
                }
                status.phase = if state == State::Succeeded {
                    Phase::Done
                } else {
                    Phase::Failed
                };
            }
            None => {
                if status.phase == Phase::Creating && all_observed {
                    tracing::info!(jxtask = %key, "All pods observed, JxTask running");
                    status.phase = Phase::Running;
                }
                if status.phase == Phase::Running {
                    status.state = State::Running;
                }
            }
        }

        self.write_status(key, &jxtask, &status).await?;
        if status.phase.is_terminal() {
            self.record_outcome(&jxtask, &status).await;
        }
        Ok(())
    }

    fn observe(&self, jxtask: &JxTask, task: &Task) -> TaskPods {
        let desired = task.desired_replicas().max(0);
        let jxtask_name = jxtask.metadata.name_str();
        let mut by_index = HashMap::new();
        let mut surplus = Vec::new();

        for pod in self.pods.filter(|p| pods::belongs_to(p, jxtask, task)) {
            match pods::pod_index(&pod) {
                Some(i)
                    if (0..desired).contains(&i)
                        && pod.metadata.name_str() == pods::pod_name(jxtask_name, &task.name, i) =>
                {
                    by_index.insert(i, pod);
                }
                _ => surplus.push(pod),
            }
        }

        TaskPods { by_index, surplus }
    }

    /// Converge one task's pods. Returns true when every desired pod was already observed.
    ///
    /// Fails with `PodNameTaken` when a replica's name is held by a pod this JxTask
    /// does not control.
    async fn sync_task(
        &self,
        key: &ObjectKey,
        jxtask: &JxTask,
        task: &Task,
        task_pods: &TaskPods,
        cluster: &str,
    ) -> Result<bool> {
        let desired = task.desired_replicas().max(0);
        let mut complete = true;

        for index in 0..desired {
            if task_pods.by_index.contains_key(&index) {
                continue;
            }
            complete = false;
            let pod = pods::build_pod(jxtask, task, index, cluster, &self.accelerators);
            let pod_key = pod.key();
            match self.clients.pods.create(pod).await {
                Ok(_) => {
                    tracing::info!(jxtask = %key, pod = %pod_key.name, task = %task.name, index, "Created pod");
                    self.recorder
                        .normal(
                            jxtask,
                            recorder::REASON_CREATED_POD,
                            format!("Created pod: {}", pod_key.name),
                        )
                        .await;
                }
                Err(e) if e.is_already_exists() => {
                    self.check_existing(key, jxtask, task, &pod_key).await?;
                }
                Err(e) => {
                    tracing::warn!(jxtask = %key, pod = %pod_key.name, error = %e, "Failed to create pod");
                    self.recorder
                        .warning(
                            jxtask,
                            recorder::REASON_FAILED_CREATE_POD,
                            format!("Error creating pod {}: {e}", pod_key.name),
                        )
                        .await;
                    return Err(e);
                }
            }
        }

        for pod in &task_pods.surplus {
            self.delete_pod(key, jxtask, pod, "surplus").await?;
        }

        Ok(complete)
    }

    /// A create hit an existing pod. Ours and not yet cached is fine; anyone else's is
    /// a name collision that no retry can resolve.
    async fn check_existing(
        &self,
        key: &ObjectKey,
        jxtask: &JxTask,
        task: &Task,
        pod_key: &ObjectKey,
    ) -> Result<()> {
        let existing = match self.clients.pods.get(pod_key).await {
            Ok(pod) => pod,
            // Deleted since the create. Its delete event requeues the key.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if pods::belongs_to(&existing, jxtask, task) {
            tracing::debug!(jxtask = %key, pod = %pod_key.name, "Pod already exists");
            return Ok(());
        }

        let owner = match existing.metadata.controller_ref() {
            Some(owner) => format!("{} {}", owner.kind, owner.name),
            None => "no controller".to_string(),
        };
        Err(ControllerError::PodNameTaken {
            pod: pod_key.to_string(),
            owner,
        })
    }

    fn task_status(&self, task: &Task, by_index: Option<&HashMap<i32, Arc<Pod>>>) -> TaskStatus {
        let mut counts = TaskStateCounts::default();
        for pod in by_index.into_iter().flat_map(|m| m.values()) {
            counts.increment(pod_task_state(pod.phase()));
        }

        let desired = u32::try_from(task.desired_replicas().max(0)).unwrap_or(0);
        let failed = counts[TaskState::Failed];
        let finished = counts[TaskState::Succeeded] + failed;

        let state = if failed > self.failure_tolerance {
            TaskState::Failed
        } else if finished >= desired {
            TaskState::Succeeded
        } else if counts[TaskState::Running] > 0 {
            TaskState::Running
        } else {
            TaskState::Unknown
        };

        TaskStatus {
            name: task.name.clone(),
            task_type: task.task_type,
            state,
            counts,
        }
    }

    /// Final outcome if the termination policy is satisfied.
    fn outcome(
        &self,
        jxtask: &JxTask,
        status: &JxTaskStatus,
        observed: &HashMap<&str, TaskPods>,
    ) -> Option<State> {
        if let Some(chief) = jxtask.spec.chief() {
            let pod = observed
                .get(chief.task_name.as_str())
                .and_then(|p| p.by_index.get(&chief.task_index))?;
            return match pod.phase() {
                PodPhase::Succeeded => Some(State::Succeeded),
                PodPhase::Failed => Some(State::Failed),
                _ => None,
            };
        }

        if status
            .task_statuses
            .iter()
            .any(|t| t.state == TaskState::Failed)
        {
            Some(State::Failed)
        } else if status
            .task_statuses
            .iter()
            .all(|t| t.state == TaskState::Succeeded)
        {
            Some(State::Succeeded)
        } else {
            None
        }
    }

    /// Delete every still-active pod the JxTask controls, including pods of tasks the
    /// spec no longer declares.
    async fn clean_up(&self, key: &ObjectKey, jxtask: &JxTask) -> Result<()> {
        let live: Vec<Arc<Pod>> = self
            .pods
            .filter(|pod| pods::controlled_by(pod, jxtask) && pod.phase().is_active());
        for pod in &live {
            self.delete_pod(key, jxtask, pod, "job finished").await?;
        }
        Ok(())
    }

    async fn delete_pod(&self, key: &ObjectKey, jxtask: &JxTask, pod: &Pod, reason: &str) -> Result<()> {
        let name = pod.metadata.name_str();
        match self.clients.pods.delete(&pod.key()).await {
            Ok(()) => {
                tracing::info!(jxtask = %key, pod = %name, reason, "Deleted pod");
                self.recorder
                    .normal(jxtask, recorder::REASON_DELETED_POD, format!("Deleted pod: {name}"))
                    .await;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                tracing::warn!(jxtask = %key, pod = %name, error = %e, "Failed to delete pod");
                self.recorder
                    .warning(
                        jxtask,
                        recorder::REASON_FAILED_DELETE_POD,
                        format!("Error deleting pod {name}: {e}"),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Mark the JxTask Failed for a reason no retry can fix, removing its live pods.
    async fn fail(
        &self,
        key: &ObjectKey,
        jxtask: &JxTask,
        current: &JxTaskStatus,
        error: ControllerError,
    ) -> Result<()> {
        tracing::warn!(jxtask = %key, error = %error, "JxTask cannot run, marking failed");
        self.clean_up(key, jxtask).await?;

        let status = JxTaskStatus {
            phase: Phase::Failed,
            state: State::Failed,
            reason: error.to_string(),
            task_statuses: current.task_statuses.clone(),
        };
        self.write_status(key, jxtask, &status).await?;

        let reason = match error {
            ControllerError::PodNameTaken { .. } => recorder::REASON_POD_NAME_TAKEN,
            _ => recorder::REASON_INVALID,
        };
        self.recorder.warning(jxtask, reason, status.reason).await;
        Ok(())
    }

    async fn record_outcome(&self, jxtask: &JxTask, status: &JxTaskStatus) {
        match status.state {
            State::Succeeded => {
                self.recorder
                    .normal(jxtask, recorder::REASON_SUCCEEDED, status.reason.clone())
                    .await
            }
            _ => {
                self.recorder
                    .warning(jxtask, recorder::REASON_FAILED, status.reason.clone())
                    .await
            }
        }
    }

    async fn write_status(&self, key: &ObjectKey, jxtask: &JxTask, status: &JxTaskStatus) -> Result<()> {
        if jxtask.status.as_ref() == Some(status) {
            return Ok(());
        }
        let outcome = self.status.write(key, status).await?;
        if status.phase.is_terminal() && outcome != WriteOutcome::Deleted {
            self.lock_finished()
                .insert(key.clone(), jxtask.metadata.uid_str().to_string());
        }
        Ok(())
    }

    fn lock_finished(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, String>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_finished(&self, key: &ObjectKey, uid: &str) -> bool {
        self.lock_finished().get(key).is_some_and(|u| u == uid)
    }

    fn forget_finished(&self, key: &ObjectKey) {
        self.lock_finished().remove(key);
    }
}

fn outcome_reason(state: State) -> &'static str {
    match state {
        State::Succeeded => "JxTask completed successfully",
        _ => "JxTask failed",
    }
}

fn pod_task_state(phase: PodPhase) -> TaskState {
    match phase {
        PodPhase::Pending | PodPhase::Running => TaskState::Running,
        PodPhase::Succeeded => TaskState::Succeeded,
        PodPhase::Failed => TaskState::Failed,
        PodPhase::Unknown => TaskState::Unknown,
    }
}
