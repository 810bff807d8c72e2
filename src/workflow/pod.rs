//! Concrete pod specs for container nodes.
//!
//! Every pod runs three containers: an `init` container that downloads input
//! artifacts, the user's `main` container, and a `wait` container that uploads
//! outputs and reports them through its termination message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::errors::{WorkflowError, WorkflowResult};
use super::types::{NodeIo, NodeStatus, Workflow};
use crate::artifacts::Artifact;
use crate::constants::labels;
use crate::objects::OwnerReference;
use crate::template::{ContainerTemplate, EnvVar, TemplateError};

/// Environment variable carrying the JSON list of downloads
pub const DOWNLOADS_ENV: &str = "FLOWMILL_ARTIFACT_DOWNLOADS";
/// Environment variable carrying the JSON list of uploads
pub const UPLOADS_ENV: &str = "FLOWMILL_ARTIFACT_UPLOADS";

pub const INIT_CONTAINER: &str = "init";
pub const MAIN_CONTAINER: &str = "main";
pub const WAIT_CONTAINER: &str = "wait";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDownload {
    pub name: String,
    /// Where the contents appear inside the main container
    pub path: String,
    /// Reference the artifact was resolved from, e.g. `steps.build.outputs.artifacts.bin`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub artifact: Artifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactUpload {
    pub name: String,
    pub path: String,
    pub artifact: Artifact,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub mem_mib: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

impl ContainerSpec {
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub owner: OwnerReference,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<u64>,
}

impl PodSpec {
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.init_containers
            .iter()
            .chain(self.containers.iter())
            .find(|c| c.name == name)
    }

    /// Downloads the init container performs
    pub fn downloads(&self) -> Vec<ArtifactDownload> {
        self.container(INIT_CONTAINER)
            .and_then(|c| c.env_value(DOWNLOADS_ENV))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// Uploads the wait container performs
    pub fn uploads(&self) -> Vec<ArtifactUpload> {
        self.container(WAIT_CONTAINER)
            .and_then(|c| c.env_value(UPLOADS_ENV))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Pod name for a node. The generation is part of the hash so a retried
/// workflow never collides with pods of the earlier run.
pub fn pod_name(workflow_name: &str, node_id: &str, generation: u64) -> String {
    let digest = Sha256::digest(format!("{node_id}@{generation}").as_bytes());
    let suffix = &hex::encode(digest)[..10];
    let max_prefix = 63 - suffix.len() - 1;
    let prefix: String = workflow_name.chars().take(max_prefix).collect();
    format!("{}-{suffix}", prefix.trim_end_matches('-'))
}

fn env(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
    }
}

/// Build the pod for a container node
pub fn build_pod(
    workflow: &Workflow,
    node: &NodeStatus,
    container: &ContainerTemplate,
    downloads: &[ArtifactDownload],
    uploads: &[ArtifactUpload],
    executor_image: &str,
) -> WorkflowResult<PodSpec> {
    let name = node.pod_name.clone().ok_or_else(|| {
        TemplateError::internal(format!("node {} has no pod name", node.name))
    })?;

    let (cpu_cores, mem_mib) = container.requested_resources();
    let main = ContainerSpec {
        name: MAIN_CONTAINER.to_string(),
        image: container.image.clone(),
        command: container.command.clone(),
        args: container.args.clone(),
        env: container.env.clone(),
        cpu_cores,
        mem_mib,
        liveness_probe: container.liveness_probe.clone(),
        readiness_probe: container.readiness_probe.clone(),
        image_pull_policy: container.image_pull_policy.clone(),
    };
    let init = ContainerSpec {
        name: INIT_CONTAINER.to_string(),
        image: executor_image.to_string(),
        args: vec!["init".to_string()],
        env: vec![env(DOWNLOADS_ENV, encode_json(downloads)?)],
        ..ContainerSpec::default()
    };
    let wait = ContainerSpec {
        name: WAIT_CONTAINER.to_string(),
        image: executor_image.to_string(),
        args: vec!["wait".to_string()],
        env: vec![env(UPLOADS_ENV, encode_json(uploads)?)],
        ..ContainerSpec::default()
    };

    let mut labels_map = BTreeMap::new();
    labels_map.insert(labels::WORKFLOW_UID.to_string(), workflow.uid().to_string());
    labels_map.insert(labels::NODE_ID.to_string(), node.id.clone());

    Ok(PodSpec {
        name,
        namespace: workflow.namespace().to_string(),
        labels: labels_map,
        annotations: container.annotations.clone(),
        owner: OwnerReference {
            api_version: "flowmill.io/v1".to_string(),
            kind: "Workflow".to_string(),
            name: workflow.name().to_string(),
            uid: workflow.uid(),
            controller: true,
        },
        init_containers: vec![init],
        containers: vec![main, wait],
        active_deadline_seconds: None,
    })
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> WorkflowResult<String> {
    serde_json::to_string(value).map_err(|e| WorkflowError::Persistence(e.into()))
}

/// Split a wait container termination message `message|outputs_json`.
/// A bare message without outputs is accepted.
pub fn demux_termination_message(raw: &str) -> WorkflowResult<(String, Option<NodeIo>)> {
    match raw.rsplit_once('|') {
        Some((message, payload)) if payload.trim_start().starts_with('{') => {
            let outputs: NodeIo = serde_json::from_str(payload).map_err(|e| {
                WorkflowError::InvalidTerminationMessage {
                    message: format!("{e}: {payload}"),
                }
            })?;
            Ok((message.to_string(), Some(outputs)))
        }
        _ => Ok((raw.to_string(), None)),
    }
}

/// Encode outputs the way the wait container reports them
pub fn mux_termination_message(message: &str, outputs: &NodeIo) -> WorkflowResult<String> {
    Ok(format!("{message}|{}", encode_json(outputs)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactLocation;
    use crate::objects::ObjectMeta;
    use crate::state_machine::NodePhase;
    use crate::template::{BaseTemplate, EmbeddedTemplate, TemplateType};
    use crate::workflow::types::WorkflowSpec;

    fn s3(key: &str) -> ArtifactLocation {
        ArtifactLocation::S3 {
            bucket: "builds".into(),
            key: key.into(),
            endpoint: None,
            region: None,
        }
    }

    #[test]
    fn test_pod_name_is_bounded_and_generation_scoped() {
        let long = "x".repeat(100);
        let name = pod_name(&long, "node-1", 1);
        assert!(name.len() <= 63);
        assert_ne!(pod_name("ci", "node-1", 1), pod_name("ci", "node-1", 2));
        assert_eq!(pod_name("ci", "node-1", 1), pod_name("ci", "node-1", 1));
        assert!(pod_name("ci", "node-1", 1).starts_with("ci-"));
    }

    #[test]
    fn test_demux_with_outputs() {
        let mut outputs = NodeIo::default();
        outputs.parameters.insert("digest".into(), "sha256:abc".into());
        outputs.artifacts.push(Artifact::new("bin", s3("ci/pod/bin")));
        let raw = mux_termination_message("done | ok", &outputs).unwrap();

        let (message, parsed) = demux_termination_message(&raw).unwrap();
        assert_eq!(message, "done | ok");
        assert_eq!(parsed, Some(outputs));
    }

    #[test]
    fn test_demux_bare_message() {
        let (message, outputs) = demux_termination_message("OOMKilled").unwrap();
        assert_eq!(message, "OOMKilled");
        assert!(outputs.is_none());

        let (message, outputs) = demux_termination_message("exit a|b").unwrap();
        assert_eq!(message, "exit a|b");
        assert!(outputs.is_none());

        assert!(demux_termination_message("bad|{not json").is_err());
    }

    #[test]
    fn test_build_pod_wires_transfers() {
        let mut container = ContainerTemplate::default();
        container.base = BaseTemplate::new(TemplateType::Container, "build");
        container.image = "golang:1.22".into();
        container.resources.cpu_cores = Some("2".into());
        container.resources.mem_mib = Some("512".into());

        let workflow = Workflow::new(
            ObjectMeta::named("team-a", "ci"),
            WorkflowSpec::new(EmbeddedTemplate::Container(container.clone())),
        );
        let mut node = NodeStatus::new("n1", "ci(0)", "build", NodePhase::Pending);
        node.pod_name = Some(pod_name("ci", "n1", 0));

        let downloads = vec![ArtifactDownload {
            name: "src".into(),
            path: "/src".into(),
            from: None,
            artifact: Artifact::new("src", s3("repo.tgz")),
        }];
        let uploads = vec![ArtifactUpload {
            name: "bin".into(),
            path: "/out/app".into(),
            artifact: Artifact::new("bin", s3("ci/pod/bin")),
        }];
        let pod = build_pod(&workflow, &node, &container, &downloads, &uploads, "executor:1").unwrap();

        assert_eq!(pod.namespace, "team-a");
        assert_eq!(pod.labels[labels::NODE_ID], "n1");
        let main = pod.container(MAIN_CONTAINER).unwrap();
        assert_eq!(main.image, "golang:1.22");
        assert_eq!(main.cpu_cores, 2.0);
        assert_eq!(pod.downloads(), downloads);
        assert_eq!(pod.uploads(), uploads);
        assert_eq!(pod.container(WAIT_CONTAINER).unwrap().image, "executor:1");
    }
}
