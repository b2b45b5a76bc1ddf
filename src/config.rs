use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::backoff::Backoff;
use crate::error::{ControllerError, Result};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_LOCK_NAME: &str = "jxtasks";

/// Lease timings for leader election.
///
/// - `lease_duration`: how long a standby waits without seeing the record change before
///   taking over
/// - `renew_deadline`: how long the holder keeps retrying a renewal before giving up
/// - `retry_period`: wait between acquire/renew attempts
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lock_name: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(5),
            retry_period: Duration::from_secs(3),
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_name.is_empty() {
            return Err(ControllerError::Config(
                "leader election lock name must not be empty".to_string(),
            ));
        }
        if self.retry_period.is_zero() {
            return Err(ControllerError::Config(
                "retry period must be positive".to_string(),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(ControllerError::Config(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(ControllerError::Config(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Host path mounted into every container that requests the accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcceleratorVolume {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnvironmentVariableConfig {
    pub name: String,
    pub value: String,
}

/// Volumes and environment injected into containers using one accelerator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcceleratorConfig {
    #[serde(default)]
    pub volumes: Vec<AcceleratorVolume>,
    #[serde(default)]
    pub env_vars: Vec<EnvironmentVariableConfig>,
}

/// Accelerator configs keyed by the container resource limit that requests them,
/// e.g. `alpha.kubernetes.io/nvidia-gpu`.
pub type Accelerators = BTreeMap<String, AcceleratorConfig>;

/// Contents of the file passed as `--controller-config-file`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControllerConfigFile {
    #[serde(default)]
    pub accelerators: Accelerators,
}

impl ControllerConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace whose JxTasks are watched. Empty watches all namespaces.
    pub namespace: String,
    /// Namespace holding the leader election lease.
    pub lease_namespace: String,
    pub workers: usize,
    pub resync_period: Duration,
    /// Leader election identity, unique per process.
    pub identity: String,
    /// Failed pods a task absorbs before it is marked Failed.
    pub failure_tolerance: u32,
    pub requeue_backoff: Backoff,
    pub leader_election: LeaderElectionConfig,
    /// Listen address of the health server. `None` disables it.
    pub health_addr: Option<SocketAddr>,
    pub accelerators: Accelerators,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            lease_namespace: DEFAULT_NAMESPACE.to_string(),
            workers: 1,
            resync_period: Duration::from_secs(30),
            identity: default_identity(),
            failure_tolerance: 0,
            requeue_backoff: Backoff::default(),
            leader_election: LeaderElectionConfig::default(),
            health_addr: None,
            accelerators: Accelerators::new(),
        }
    }
}

impl ControllerConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            lease_namespace: lease_namespace_for(&namespace),
            namespace,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_failure_tolerance(mut self, tolerance: u32) -> Self {
        self.failure_tolerance = tolerance;
        self
    }

    pub fn with_requeue_backoff(mut self, backoff: Backoff) -> Self {
        self.requeue_backoff = backoff;
        self
    }

    pub fn with_leader_election(mut self, leader_election: LeaderElectionConfig) -> Self {
        self.leader_election = leader_election;
        self
    }

    pub fn with_health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }

    pub fn with_accelerators(mut self, accelerators: Accelerators) -> Self {
        self.accelerators = accelerators;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ControllerError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.identity.is_empty() {
            return Err(ControllerError::Config(
                "identity must not be empty".to_string(),
            ));
        }
        if self.resync_period.is_zero() {
            return Err(ControllerError::Config(
                "resync period must be positive".to_string(),
            ));
        }
        for (name, accelerator) in &self.accelerators {
            if let Some(volume) = accelerator
                .volumes
                .iter()
                .find(|v| v.name.is_empty() || v.mount_path.is_empty())
            {
                return Err(ControllerError::Config(format!(
                    "accelerator {name} volume {:?} needs a name and a mount path",
                    volume.name
                )));
            }
        }
        self.leader_election.validate()
    }
}

/// The lease lives in the watched namespace, or `default` when watching all of them.
fn lease_namespace_for(namespace: &str) -> String {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace.to_string()
    }
}

/// Hostname of this process, or a random `jx-controller-<uuid>` when none is available.
pub fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("jx-controller-{}", Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_election_config_default() {
        let cfg = LeaderElectionConfig::default();
        assert_eq!(cfg.lock_name, "jxtasks");
        assert_eq!(cfg.lease_duration, Duration::from_secs(15));
        assert_eq!(cfg.renew_deadline, Duration::from_secs(5));
        assert_eq!(cfg.retry_period, Duration::from_secs(3));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.namespace, "default");
        assert_eq!(cfg.lease_namespace, "default");
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.resync_period, Duration::from_secs(30));
        assert_eq!(cfg.failure_tolerance, 0);
        assert!(!cfg.identity.is_empty());
        assert!(cfg.health_addr.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn controller_config_builder() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ControllerConfig::new("ml")
            .with_workers(4)
            .with_identity("node-a")
            .with_failure_tolerance(2)
            .with_resync_period(Duration::from_secs(5))
            .with_health_addr(addr);
        assert_eq!(cfg.namespace, "ml");
        assert_eq!(cfg.lease_namespace, "ml");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.identity, "node-a");
        assert_eq!(cfg.failure_tolerance, 2);
        assert_eq!(cfg.resync_period, Duration::from_secs(5));
        assert_eq!(cfg.health_addr, Some(addr));
    }

    #[test]
    fn all_namespaces_keeps_lease_in_default() {
        let cfg = ControllerConfig::new("");
        assert_eq!(cfg.namespace, "");
        assert_eq!(cfg.lease_namespace, "default");
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = ControllerConfig::default().with_workers(0);
        assert!(matches!(cfg.validate(), Err(ControllerError::Config(_))));
    }

    #[test]
    fn renew_deadline_must_be_shorter_than_lease() {
        let cfg = LeaderElectionConfig {
            renew_deadline: Duration::from_secs(15),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn controller_config_file_reads_accelerators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        std::fs::write(
            &path,
            r#"{
                "Accelerators": {
                    "alpha.kubernetes.io/nvidia-gpu": {
                        "Volumes": [
                            {"Name": "cuda-lib", "HostPath": "/home/cuda", "MountPath": "/usr/local/cuda"}
                        ],
                        "EnvVars": [{"Name": "LD_LIBRARY_PATH", "Value": "/usr/local/cuda/lib64"}]
                    }
                }
            }"#,
        )
        .unwrap();

        let file = ControllerConfigFile::load(&path).unwrap();
        let gpu = &file.accelerators["alpha.kubernetes.io/nvidia-gpu"];
        assert_eq!(gpu.volumes[0].mount_path, "/usr/local/cuda");
        assert_eq!(gpu.env_vars[0].name, "LD_LIBRARY_PATH");

        let cfg = ControllerConfig::default().with_accelerators(file.accelerators);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn accelerator_volume_without_mount_path_rejected() {
        let accelerators = Accelerators::from([(
            "nvidia.com/gpu".to_string(),
            AcceleratorConfig {
                volumes: vec![AcceleratorVolume {
                    name: "lib".into(),
                    host_path: "/usr/lib".into(),
                    mount_path: String::new(),
                }],
                env_vars: Vec::new(),
            },
        )]);
        let cfg = ControllerConfig::default().with_accelerators(accelerators);
        assert!(matches!(cfg.validate(), Err(ControllerError::Config(_))));
    }

    #[test]
    fn retry_period_must_be_shorter_than_renew_deadline() {
        let cfg = LeaderElectionConfig {
            retry_period: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
