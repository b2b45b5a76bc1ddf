use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("Conflict writing {kind} {key}: resource version {expected} is stale")]
    Conflict {
        kind: &'static str,
        key: String,
        expected: u64,
    },

    #[error("Watch resource version {0} is too old, relist required")]
    Expired(u64),

    #[error("Cluster API error: {0}")]
    Api(String),

    #[error("Invalid JxTask spec: {0}")]
    Validation(String),

    #[error("Pod {pod} already exists and is controlled by {owner}")]
    PodNameTaken { pod: String, owner: String },

    #[error("Caches not synced: {0}")]
    NotSynced(String),

    #[error("Leadership lost by {0}")]
    LeadershipLost(String),

    #[error("Gave up writing status for {key} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { key: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Errors that should put the key back on the queue with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::Api(_)
                | ControllerError::Conflict { .. }
                | ControllerError::ConflictRetriesExhausted { .. }
                | ControllerError::Expired(_)
                | ControllerError::Io(_)
                | ControllerError::Internal(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ControllerError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
