use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::{Index, IndexMut};

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

pub const GROUP: &str = "jiaxuan.org";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "jiaxuan.org/v1alpha1";
pub const KIND: &str = "JxTask";
pub const PLURAL: &str = "jxtasks";

/// Label applied to every pod the controller creates.
pub const APP_LABEL_KEY: &str = "app";
pub const APP_LABEL_VALUE: &str = "by-jiaxuan";

pub const DEFAULT_JX_PORT: i32 = 9999;
pub const DEFAULT_REPLICAS: i32 = 1;

/// How a set of replicas is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum TaskType {
    #[default]
    #[serde(rename = "BATCH")]
    Batch,
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Batch => write!(f, "BATCH"),
            TaskType::Online => write!(f, "ONLINE"),
            TaskType::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// A named, replicated group of pods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    /// Desired replicas. `None` means the default of one, not zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jx_port: Option<i32>,
    #[serde(rename = "jxTaskType", default)]
    pub task_type: TaskType,
}

impl Task {
    pub fn new(name: impl Into<String>, replicas: i32, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            replicas: Some(replicas),
            template: None,
            jx_port: None,
            task_type,
        }
    }

    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn port(&self) -> i32 {
        self.jx_port.unwrap_or(DEFAULT_JX_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChiefSpec {
    pub task_name: String,
    pub task_index: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TerminationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chief: Option<ChiefSpec>,
}

/// Desired state of a JxTask. The derive generates the [`JxTask`] resource itself.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "jiaxuan.org",
    version = "v1alpha1",
    kind = "JxTask",
    plural = "jxtasks",
    shortname = "jx",
    namespaced,
    status = "JxTaskStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct JxTaskSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime_id: String,
    #[serde(rename = "task", alias = "tasks", default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
    /// Opaque; copied onto every pod for external scheduler extensions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheduler_name: String,
}

impl JxTaskSpec {
    pub fn chief(&self) -> Option<&ChiefSpec> {
        self.termination_policy.as_ref().and_then(|p| p.chief.as_ref())
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Structural checks. A failure here is terminal for the JxTask.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(ControllerError::Validation("no tasks declared".to_string()));
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(ControllerError::Validation(
                    "task name must not be empty".to_string(),
                ));
            }
            if !task
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(ControllerError::Validation(format!(
                    "task name {:?} may only contain alphanumerics and '-'",
                    task.name
                )));
            }
            if !seen.insert(task.name.to_ascii_lowercase()) {
                return Err(ControllerError::Validation(format!(
                    "duplicate task name {:?}",
                    task.name
                )));
            }
            if task.desired_replicas() < 0 {
                return Err(ControllerError::Validation(format!(
                    "task {:?} has negative replicas {}",
                    task.name,
                    task.desired_replicas()
                )));
            }
            if !(1..=65535).contains(&task.port()) {
                return Err(ControllerError::Validation(format!(
                    "task {:?} has invalid jxPort {}",
                    task.name,
                    task.port()
                )));
            }
        }

        if let Some(chief) = self.chief() {
            let task = self.task(&chief.task_name).ok_or_else(|| {
                ControllerError::Validation(format!(
                    "chief references unknown task {:?}",
                    chief.task_name
                ))
            })?;
            if chief.task_index < 0 || chief.task_index >= task.desired_replicas() {
                return Err(ControllerError::Validation(format!(
                    "chief index {} is outside task {:?} replicas {}",
                    chief.task_index,
                    chief.task_name,
                    task.desired_replicas()
                )));
            }
        }

        Ok(())
    }
}

/// Coarse lifecycle stage of a JxTask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    None,
    Creating,
    Running,
    CleanUp,
    Failed,
    Done,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed | Phase::Done)
    }

    fn rank(self) -> u8 {
        match self {
            Phase::None => 0,
            Phase::Creating => 1,
            Phase::Running => 2,
            Phase::CleanUp => 3,
            Phase::Failed | Phase::Done => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the phase monotonic.
    /// Re-applying the current phase is allowed; leaving a terminal phase is not.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::None => write!(f, "None"),
            Phase::Creating => write!(f, "Creating"),
            Phase::Running => write!(f, "Running"),
            Phase::CleanUp => write!(f, "CleanUp"),
            Phase::Failed => write!(f, "Failed"),
            Phase::Done => write!(f, "Done"),
        }
    }
}

/// Overall outcome of a JxTask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum State {
    #[default]
    Unknown,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unknown => write!(f, "Unknown"),
            State::Running => write!(f, "Running"),
            State::Succeeded => write!(f, "Succeeded"),
            State::Failed => write!(f, "Failed"),
        }
    }
}

/// Aggregate health of one task's pods.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum TaskState {
    #[default]
    Unknown,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub const ALL: [TaskState; 4] = [
        TaskState::Unknown,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
    ];

    const fn slot(self) -> usize {
        match self {
            TaskState::Unknown => 0,
            TaskState::Running => 1,
            TaskState::Succeeded => 2,
            TaskState::Failed => 3,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Unknown => write!(f, "Unknown"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Succeeded => write!(f, "Succeeded"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

/// Pod counts per [`TaskState`], stored as a fixed table.
///
/// Serialized as a map so the status reads naturally: `{"Running": 2, ...}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<TaskState, u32>",
    into = "BTreeMap<TaskState, u32>"
)]
pub struct TaskStateCounts([u32; 4]);

impl TaskStateCounts {
    pub fn increment(&mut self, state: TaskState) {
        self.0[state.slot()] = self.0[state.slot()].saturating_add(1);
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

impl Index<TaskState> for TaskStateCounts {
    type Output = u32;

    fn index(&self, state: TaskState) -> &u32 {
        &self.0[state.slot()]
    }
}

impl IndexMut<TaskState> for TaskStateCounts {
    fn index_mut(&mut self, state: TaskState) -> &mut u32 {
        &mut self.0[state.slot()]
    }
}

impl From<BTreeMap<TaskState, u32>> for TaskStateCounts {
    fn from(map: BTreeMap<TaskState, u32>) -> Self {
        let mut counts = TaskStateCounts::default();
        for (state, n) in map {
            counts[state] = n;
        }
        counts
    }
}

impl From<TaskStateCounts> for BTreeMap<TaskState, u32> {
    fn from(counts: TaskStateCounts) -> Self {
        TaskState::ALL
            .iter()
            .map(|&state| (state, counts[state]))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub name: String,
    #[serde(rename = "jxTaskType")]
    pub task_type: TaskType,
    pub state: TaskState,
    #[serde(rename = "tasksStates", default)]
    #[schemars(with = "BTreeMap<TaskState, u32>")]
    pub counts: TaskStateCounts,
}

impl TaskStatus {
    pub fn placeholder(task: &Task) -> Self {
        Self {
            name: task.name.clone(),
            task_type: task.task_type,
            state: TaskState::Unknown,
            counts: TaskStateCounts::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JxTaskStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub task_statuses: Vec<TaskStatus>,
}

impl JxTask {
    pub fn namespaced(namespace: impl Into<String>, name: &str, spec: JxTaskSpec) -> Self {
        let mut jxtask = Self::new(name, spec);
        jxtask.metadata.namespace = Some(namespace.into());
        jxtask
    }

    /// The stored status, or the empty status of a JxTask never reconciled.
    pub fn current_status(&self) -> JxTaskStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
