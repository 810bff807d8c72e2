//! Builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use flowmill_core::artifacts::ArtifactLocation;
use flowmill_core::config::WorkflowConfig;
use flowmill_core::deployment::Deployment;
use flowmill_core::events::EventPublisher;
use flowmill_core::objects::ObjectMeta;
use flowmill_core::persistence::DisabledOffloadRepo;
use flowmill_core::repository::{ArtifactRepository, InMemoryConfigMaps, RepositoryResolver};
use flowmill_core::template::{
    BaseTemplate, ContainerResources, ContainerTemplate, EmbeddedDeployment, EmbeddedStep,
    EmbeddedTemplate, EmbeddedWorkflow, RollingUpdate, Scale, Strategy, TemplateType,
};
use flowmill_core::workflow::{InMemoryPodRuntime, Workflow, WorkflowOperator, WorkflowSpec};

pub const NAMESPACE: &str = "ci";

pub fn container(name: &str) -> ContainerTemplate {
    ContainerTemplate {
        base: BaseTemplate::new(TemplateType::Container, name),
        image: "alpine:3.20".into(),
        command: vec!["sh".into(), "-c".into(), "true".into()],
        ..Default::default()
    }
}

pub fn step(template: ContainerTemplate) -> EmbeddedStep {
    EmbeddedStep {
        template: Some(Box::new(EmbeddedTemplate::Container(template))),
        ..Default::default()
    }
}

/// A workflow running `groups` in order; the steps of one group run in parallel
pub fn steps_workflow(name: &str, groups: Vec<Vec<(&str, EmbeddedStep)>>) -> Workflow {
    let template = EmbeddedWorkflow {
        base: BaseTemplate::new(TemplateType::Workflow, name),
        steps: groups
            .into_iter()
            .map(|group| group.into_iter().map(|(n, s)| (n.to_string(), s)).collect())
            .collect(),
        ..Default::default()
    };
    let mut metadata = ObjectMeta::named(NAMESPACE, name);
    metadata.generation = 1;
    Workflow::new(metadata, WorkflowSpec::new(EmbeddedTemplate::Workflow(template)))
}

pub fn operator(runtime: Arc<InMemoryPodRuntime>) -> WorkflowOperator {
    let repository = ArtifactRepository {
        archive_logs: false,
        key_format: None,
        location: ArtifactLocation::S3 {
            bucket: "artifacts".into(),
            key: String::new(),
            endpoint: None,
            region: None,
        },
    };
    let resolver = RepositoryResolver::new(
        Arc::new(InMemoryConfigMaps::new()),
        "flowmill",
        Some(repository),
    );
    WorkflowOperator::new(
        runtime,
        Arc::new(DisabledOffloadRepo),
        Arc::new(resolver),
        EventPublisher::new(64),
        WorkflowConfig::default(),
    )
}

/// Pod name of the attempt node called `node_name`
pub fn pod_of(workflow: &Workflow, node_name: &str) -> String {
    workflow
        .node_by_name(node_name)
        .and_then(|node| node.pod_name.clone())
        .unwrap_or_else(|| panic!("no pod for {node_name}"))
}

/// Single-container deployment; `strategy` is `(type, max_surge, max_unavailable)`
pub fn deployment(name: &str, scale: u32, cpu: &str, mem: &str, strategy: Option<(&str, &str, &str)>) -> Deployment {
    let web = ContainerTemplate {
        base: BaseTemplate::new(TemplateType::Container, "web"),
        image: "nginx:1.27".into(),
        resources: ContainerResources {
            cpu_cores: Some(cpu.into()),
            mem_mib: Some(mem.into()),
        },
        ..Default::default()
    };
    let mut containers = BTreeMap::new();
    containers.insert("web".to_string(), step(web));

    let template = EmbeddedDeployment {
        base: BaseTemplate::new(TemplateType::Deployment, name),
        application_name: "shop".into(),
        deployment_name: name.into(),
        scale: Scale { min: scale, max: None },
        strategy: strategy.map(|(kind, surge, unavailable)| Strategy {
            strategy_type: kind.to_string(),
            rolling_update: Some(RollingUpdate {
                max_surge: Some(surge.to_string()),
                max_unavailable: Some(unavailable.to_string()),
            }),
        }),
        containers,
        ..Default::default()
    };
    Deployment::new("shop", name, template)
}
