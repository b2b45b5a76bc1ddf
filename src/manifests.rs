//! JxTask manifests on disk, for running against the in-memory cluster.

use std::path::Path;

use crate::api::{JxTask, MetaExt, Resource};
use crate::client::MemoryCluster;
use crate::error::{ControllerError, Result};

/// Read every `*.json` file in `dir` as a JxTask, in file name order.
///
/// Objects without a namespace land in `default_namespace`. Server-owned fields
/// (uid, resource version, status) are reset.
pub fn load_dir(dir: &Path, default_namespace: &str) -> Result<Vec<JxTask>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut tasks = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)?;
        let mut task: JxTask = serde_json::from_str(&raw).map_err(|e| {
            ControllerError::Config(format!("invalid manifest {}: {e}", path.display()))
        })?;
        if task.metadata.name_str().is_empty() {
            return Err(ControllerError::Config(format!(
                "manifest {} has no metadata.name",
                path.display()
            )));
        }
        if task.metadata.namespace_str().is_empty() {
            task.metadata.namespace = Some(default_namespace.to_string());
        }
        task.metadata.uid = None;
        task.metadata.resource_version = None;
        task.status = None;
        tasks.push(task);
    }
    Ok(tasks)
}

/// Load `dir` into `cluster`. Returns how many JxTasks were added.
pub fn seed(cluster: &MemoryCluster, dir: &Path, default_namespace: &str) -> Result<usize> {
    let tasks = load_dir(dir, default_namespace)?;
    let count = tasks.len();
    for task in tasks {
        let key = task.key();
        cluster.jxtasks.insert(task)?;
        tracing::info!(jxtask = %key, "Loaded manifest");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "apiVersion": "jiaxuan.org/v1alpha1",
        "kind": "JxTask",
        "metadata": {"name": "mnist"},
        "spec": {"task": [{"name": "worker", "replicas": 2, "jxTaskType": "BATCH"}]}
    }"#;

    #[test]
    fn loads_json_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), MANIFEST).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let tasks = load_dir(dir.path(), "ml").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].metadata.namespace_str(), "ml");
        assert_eq!(tasks[0].spec.tasks[0].desired_replicas(), 2);
    }

    #[test]
    fn bad_manifest_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let err = load_dir(dir.path(), "default").unwrap_err();
        assert!(matches!(err, ControllerError::Config(ref m) if m.contains("broken.json")));
    }

    #[test]
    fn seed_inserts_into_cluster() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), MANIFEST).unwrap();
        let cluster = MemoryCluster::new();
        assert_eq!(seed(&cluster, dir.path(), "default").unwrap(), 1);
        assert_eq!(cluster.jxtasks.len(), 1);
    }
}
