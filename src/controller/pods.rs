//! Pod naming, labelling and construction for JxTask replicas.

use std::collections::BTreeMap;

use crate::api::jxtask::{API_VERSION, APP_LABEL_KEY, APP_LABEL_VALUE, KIND};
use crate::api::{
    object_meta, Container, ContainerPort, EnvVar, HostPathVolumeSource, JxTask, MetaExt,
    OwnerReference, Pod, PodSpec, PodTemplateSpec, Task, Volume, VolumeMount,
};
use crate::config::{AcceleratorConfig, Accelerators};
use crate::error::Result;

pub const LABEL_JXTASK_NAME: &str = "jx-task-name";
pub const LABEL_TASK_TYPE: &str = "jx-task-type";
pub const LABEL_TASK_INDEX: &str = "jx-task-index";

pub const DEFAULT_CONTAINER_NAME: &str = "busybox";
pub const DEFAULT_IMAGE: &str = "busybox";
pub const PORT_NAME: &str = "jx-port";
pub const DEFAULT_RESTART_POLICY: &str = "Never";

pub const ENV_NAMESPACE: &str = "JX_NAMESPACE";
pub const ENV_TASK_NAME: &str = "JX_TASK_NAME";
pub const ENV_TASK_INDEX: &str = "JX_TASK_INDEX";
pub const ENV_CLUSTER: &str = "JX_CLUSTER";
pub const ENV_PORT: &str = "JX_PORT";

pub fn pod_name(jxtask: &str, task: &str, index: i32) -> String {
    format!("{jxtask}-{task}-{index}").to_ascii_lowercase()
}

/// Labels identifying the pods of one task of one JxTask.
pub fn selector(jxtask: &str, task: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
        (LABEL_JXTASK_NAME.to_string(), jxtask.to_string()),
        (LABEL_TASK_TYPE.to_string(), task.to_string()),
    ])
}

/// Whether `pod` is controlled by `jxtask`, whatever task it was created for.
pub fn controlled_by(pod: &Pod, jxtask: &JxTask) -> bool {
    pod.metadata.namespace_str() == jxtask.metadata.namespace_str()
        && pod
            .metadata
            .controller_ref()
            .is_some_and(|owner| owner.uid == jxtask.metadata.uid_str())
}

/// Whether `pod` belongs to `task` of `jxtask`: labels match and the controller
/// reference points at this JxTask's uid. Orphans with matching labels are ignored.
pub fn belongs_to(pod: &Pod, jxtask: &JxTask, task: &Task) -> bool {
    let wanted = selector(jxtask.metadata.name_str(), &task.name);
    wanted
        .iter()
        .all(|(k, v)| pod.metadata.label(k) == Some(v.as_str()))
        && controlled_by(pod, jxtask)
}

/// Replica index from the pod's index label. `None` when missing or unparsable.
pub fn pod_index(pod: &Pod) -> Option<i32> {
    pod.metadata
        .label(LABEL_TASK_INDEX)
        .and_then(|v| v.parse().ok())
}

pub fn owner_reference(jxtask: &JxTask) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: jxtask.metadata.name_str().to_string(),
        uid: jxtask.metadata.uid_str().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn default_containers() -> Vec<Container> {
    vec![Container {
        name: DEFAULT_CONTAINER_NAME.to_string(),
        image: Some(DEFAULT_IMAGE.to_string()),
        ..Default::default()
    }]
}

/// Peer addresses of every task, as `{"task": ["pod:port", ...]}` JSON.
pub fn cluster_spec(jxtask: &JxTask) -> Result<String> {
    let name = jxtask.metadata.name_str();
    let peers: BTreeMap<&str, Vec<String>> = jxtask
        .spec
        .tasks
        .iter()
        .map(|task| {
            let addrs = (0..task.desired_replicas().max(0))
                .map(|i| format!("{}:{}", pod_name(name, &task.name, i), task.port()))
                .collect();
            (task.name.as_str(), addrs)
        })
        .collect();
    Ok(serde_json::to_string(&peers)?)
}

fn set_env(env: &mut Vec<EnvVar>, name: &str, value: String) {
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => existing.value = Some(value),
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        }),
    }
}

/// Mount the host paths and set the environment of `accelerator` on `container`.
/// Volumes shared by several containers are declared once on the pod.
fn apply_accelerator(
    spec_volumes: &mut Vec<Volume>,
    container: &mut Container,
    accelerator: &AcceleratorConfig,
) {
    for volume in &accelerator.volumes {
        if !spec_volumes.iter().any(|v| v.name == volume.name) {
            spec_volumes.push(Volume {
                name: volume.name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: volume.host_path.clone(),
                    type_: None,
                }),
                ..Default::default()
            });
        }
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        if !mounts.iter().any(|m| m.name == volume.name) {
            mounts.push(VolumeMount {
                name: volume.name.clone(),
                mount_path: volume.mount_path.clone(),
                ..Default::default()
            });
        }
    }

    let env = container.env.get_or_insert_with(Vec::new);
    for var in &accelerator.env_vars {
        set_env(env, &var.name, var.value.clone());
    }
}

/// Accelerators requested through the container's resource limits.
fn requested<'a>(
    container: &Container,
    accelerators: &'a Accelerators,
) -> Vec<&'a AcceleratorConfig> {
    let Some(limits) = container.resources.as_ref().and_then(|r| r.limits.as_ref()) else {
        return Vec::new();
    };
    limits
        .keys()
        .filter_map(|resource| accelerators.get(resource))
        .collect()
}

/// Build replica `index` of `task` from its template (or the default one).
///
/// `cluster` is the precomputed [`cluster_spec`] of the JxTask.
pub fn build_pod(
    jxtask: &JxTask,
    task: &Task,
    index: i32,
    cluster: &str,
    accelerators: &Accelerators,
) -> Pod {
    let template = task.template.clone().unwrap_or_default();
    let ns = jxtask.metadata.namespace_str().to_string();
    let jxtask_name = jxtask.metadata.name_str();

    let mut metadata = object_meta(ns.clone(), pod_name(jxtask_name, &task.name, index));
    let mut labels = template
        .metadata
        .and_then(|meta| meta.labels)
        .unwrap_or_default();
    labels.extend(selector(jxtask_name, &task.name));
    labels.insert(LABEL_TASK_INDEX.to_string(), index.to_string());
    metadata.labels = Some(labels);
    metadata.owner_references = Some(vec![owner_reference(jxtask)]);

    let mut spec = template.spec.unwrap_or_default();
    if spec.containers.is_empty() {
        spec.containers = default_containers();
    }
    if spec.restart_policy.as_deref().unwrap_or_default().is_empty() {
        spec.restart_policy = Some(DEFAULT_RESTART_POLICY.to_string());
    }
    if !jxtask.spec.scheduler_name.is_empty() {
        spec.scheduler_name = Some(jxtask.spec.scheduler_name.clone());
    }

    let PodSpec {
        containers,
        volumes,
        ..
    } = &mut spec;
    let port = task.port();
    for container in containers.iter_mut() {
        for accelerator in requested(container, accelerators) {
            apply_accelerator(volumes.get_or_insert_with(Vec::new), container, accelerator);
        }

        let env = container.env.get_or_insert_with(Vec::new);
        set_env(env, ENV_NAMESPACE, ns.clone());
        set_env(env, ENV_TASK_NAME, task.name.clone());
        set_env(env, ENV_TASK_INDEX, index.to_string());
        set_env(env, ENV_CLUSTER, cluster.to_string());
        set_env(env, ENV_PORT, port.to_string());

        let ports = container.ports.get_or_insert_with(Vec::new);
        if !ports.iter().any(|p| p.name.as_deref() == Some(PORT_NAME)) {
            ports.push(ContainerPort {
                name: Some(PORT_NAME.to_string()),
                container_port: port,
                ..Default::default()
            });
        }
    }

    Pod {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

/// Pod template with a single container, for callers that only set a few fields.
pub fn template_with(container: Container) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![container],
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::api::{JxTaskSpec, ObjectMeta, ResourceRequirements, TaskType};
    use crate::config::{AcceleratorVolume, EnvironmentVariableConfig};

    const GPU: &str = "alpha.kubernetes.io/nvidia-gpu";

    fn jxtask() -> JxTask {
        let mut t = JxTask::namespaced(
            "ml",
            "Train",
            JxTaskSpec {
                tasks: vec![
                    Task::new("PS", 1, TaskType::Online),
                    Task::new("worker", 2, TaskType::Batch),
                ],
                scheduler_name: "kube-batch".into(),
                ..Default::default()
            },
        );
        t.metadata.uid = Some("uid-1".into());
        t
    }

    fn spec(pod: &Pod) -> &PodSpec {
        pod.spec.as_ref().unwrap()
    }

    fn env<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .iter()
            .flatten()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    fn gpu_accelerators() -> Accelerators {
        Accelerators::from([(
            GPU.to_string(),
            AcceleratorConfig {
                volumes: vec![AcceleratorVolume {
                    name: "cuda-lib".into(),
                    host_path: "/home/cuda".into(),
                    mount_path: "/usr/local/cuda".into(),
                }],
                env_vars: vec![EnvironmentVariableConfig {
                    name: "LD_LIBRARY_PATH".into(),
                    value: "/usr/local/cuda/lib64".into(),
                }],
            },
        )])
    }

    #[test]
    fn pod_name_is_lowercased() {
        assert_eq!(pod_name("Train", "PS", 0), "train-ps-0");
    }

    #[test]
    fn default_template_pod() {
        let t = jxtask();
        let cluster = cluster_spec(&t).unwrap();
        let pod = build_pod(&t, &t.spec.tasks[1], 1, &cluster, &Accelerators::new());

        assert_eq!(pod.metadata.name_str(), "train-worker-1");
        assert_eq!(pod.metadata.namespace_str(), "ml");
        assert_eq!(pod.metadata.label("app"), Some("by-jiaxuan"));
        assert_eq!(pod.metadata.label(LABEL_JXTASK_NAME), Some("Train"));
        assert_eq!(pod.metadata.label(LABEL_TASK_TYPE), Some("worker"));
        assert_eq!(pod_index(&pod), Some(1));

        let container = &spec(&pod).containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        assert_eq!(spec(&pod).restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec(&pod).scheduler_name.as_deref(), Some("kube-batch"));
        assert!(spec(&pod).volumes.is_none());

        let owner = pod.metadata.controller_ref().unwrap();
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.kind, "JxTask");

        assert_eq!(env(container, ENV_TASK_INDEX), Some("1"));
        assert_eq!(env(container, ENV_PORT), Some("9999"));
        assert_eq!(env(container, ENV_NAMESPACE), Some("ml"));
        assert_eq!(
            container.ports.as_ref().unwrap()[0].name.as_deref(),
            Some(PORT_NAME)
        );
        assert!(belongs_to(&pod, &t, &t.spec.tasks[1]));
        assert!(!belongs_to(&pod, &t, &t.spec.tasks[0]));
        assert!(controlled_by(&pod, &t));
    }

    #[test]
    fn template_values_are_kept() {
        let mut t = jxtask();
        let mut template = template_with(Container {
            name: "trainer".into(),
            image: Some("trainer:v2".into()),
            env: Some(vec![EnvVar {
                name: "LR".into(),
                value: Some("0.1".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        if let Some(spec) = template.spec.as_mut() {
            spec.restart_policy = Some("OnFailure".into());
        }
        template.metadata = Some(ObjectMeta {
            labels: Some(BTreeMap::from([("team".into(), "research".into())])),
            ..Default::default()
        });
        t.spec.tasks[1].template = Some(template);
        t.spec.tasks[1].jx_port = Some(2222);

        let pod = build_pod(&t, &t.spec.tasks[1], 0, "{}", &Accelerators::new());
        let container = &spec(&pod).containers[0];
        assert_eq!(container.image.as_deref(), Some("trainer:v2"));
        assert_eq!(spec(&pod).restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod.metadata.label("team"), Some("research"));
        assert_eq!(env(container, "LR"), Some("0.1"));
        assert_eq!(env(container, ENV_PORT), Some("2222"));
    }

    #[test]
    fn accelerator_limits_get_volumes_and_env() {
        let mut t = jxtask();
        let gpu_container = Container {
            name: "trainer".into(),
            image: Some("trainer:gpu".into()),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([(GPU.to_string(), Quantity("1".into()))])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut template = template_with(gpu_container);
        if let Some(spec) = template.spec.as_mut() {
            spec.containers.push(Container {
                name: "sidecar".into(),
                image: Some("busybox".into()),
                ..Default::default()
            });
        }
        t.spec.tasks[1].template = Some(template);

        let pod = build_pod(&t, &t.spec.tasks[1], 0, "{}", &gpu_accelerators());
        let volumes = spec(&pod).volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "cuda-lib");
        assert_eq!(
            volumes[0].host_path.as_ref().map(|h| h.path.as_str()),
            Some("/home/cuda")
        );

        let trainer = &spec(&pod).containers[0];
        let mounts = trainer.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/usr/local/cuda");
        assert_eq!(env(trainer, "LD_LIBRARY_PATH"), Some("/usr/local/cuda/lib64"));

        // Containers that do not request the accelerator are left alone.
        let sidecar = &spec(&pod).containers[1];
        assert!(sidecar.volume_mounts.is_none());
        assert_eq!(env(sidecar, "LD_LIBRARY_PATH"), None);
        assert_eq!(env(sidecar, ENV_TASK_NAME), Some("worker"));
    }

    #[test]
    fn cluster_spec_lists_every_peer() {
        let json: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&cluster_spec(&jxtask()).unwrap()).unwrap();
        assert_eq!(json["PS"], vec!["train-ps-0:9999"]);
        assert_eq!(json["worker"], vec!["train-worker-0:9999", "train-worker-1:9999"]);
    }

    #[test]
    fn foreign_owner_does_not_belong() {
        let t = jxtask();
        let mut pod = build_pod(&t, &t.spec.tasks[0], 0, "{}", &Accelerators::new());
        if let Some(owners) = pod.metadata.owner_references.as_mut() {
            owners[0].uid = "someone-else".into();
        }
        assert!(!belongs_to(&pod, &t, &t.spec.tasks[0]));
        assert!(!controlled_by(&pod, &t));

        pod.metadata.owner_references = None;
        assert!(!belongs_to(&pod, &t, &t.spec.tasks[0]));
    }

    #[test]
    fn bad_index_label_is_none() {
        let t = jxtask();
        let mut pod = build_pod(&t, &t.spec.tasks[0], 0, "{}", &Accelerators::new());
        if let Some(labels) = pod.metadata.labels.as_mut() {
            labels.insert(LABEL_TASK_INDEX.into(), "abc".into());
        }
        assert_eq!(pod_index(&pod), None);
    }
}
