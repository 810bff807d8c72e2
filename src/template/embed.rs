//! # Embedded Templates
//!
//! An embedded template is a template with every reference replaced by the
//! referenced body, so it can be executed without the build context. Inlined
//! containers are reverse-inlined into named containers on the way.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::container::ContainerTemplate;
use super::context::BuildContext;
use super::deployment::{ExternalRoute, InternalRoute, Scale, Strategy, StrategyType};
use super::document::Template;
use super::errors::{TemplateError, TemplateResult};
use super::inline::InlineContainerTemplateRef;
use super::params::{validate_receiver_params, ParamMap, ParamType};
use super::types::{
    Arguments, BaseTemplate, Inputs, Outputs, TemplateType, TerminationPolicy, VolumeRequirement,
};
use super::workflow::{AgentExecutor, StepFlags, WorkflowTemplate};
use super::deployment::DeploymentTemplate;

/// A step or fixture slot after embedding: the body it runs and its arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Box<EmbeddedTemplate>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<AgentExecutor>,
}

impl EmbeddedStep {
    pub fn parsed_flags(&self) -> TemplateResult<StepFlags> {
        StepFlags::parse(&self.flags)
    }
}

/// Fixture requirement after embedding. Dynamic fixtures carry their container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedFixture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Box<EmbeddedTemplate>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl EmbeddedFixture {
    pub fn is_dynamic(&self) -> bool {
        self.template.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedWorkflow {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<BTreeMap<String, EmbeddedStep>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<BTreeMap<String, EmbeddedFixture>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedDeployment {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    pub application_name: String,
    pub deployment_name: String,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_routes: Vec<ExternalRoute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_routes: Vec<InternalRoute>,
    #[serde(default)]
    pub containers: BTreeMap<String, EmbeddedStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<BTreeMap<String, EmbeddedFixture>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

impl EmbeddedDeployment {
    /// The single container every instance runs
    pub fn container(&self) -> Option<&ContainerTemplate> {
        self.containers
            .values()
            .next()
            .and_then(|slot| slot.template.as_deref())
            .and_then(EmbeddedTemplate::as_container)
    }

    /// Requested (cpu cores, memory MiB) of one instance, summed over its containers
    pub fn instance_resources(&self) -> (f64, f64) {
        self.containers
            .values()
            .filter_map(|slot| slot.template.as_deref())
            .filter_map(EmbeddedTemplate::as_container)
            .map(ContainerTemplate::requested_resources)
            .fold((0.0, 0.0), |(cpu, mem), (c, m)| (cpu + c, mem + m))
    }

    pub fn strategy_type(&self) -> TemplateResult<StrategyType> {
        Strategy::resolve(self.strategy.as_ref(), !self.volumes.is_empty())
    }

    pub fn rolling_update_limits(&self) -> (u32, u32) {
        Strategy::limits(self.strategy.as_ref())
    }
}

/// A fully resolved, self-contained template
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EmbeddedTemplate {
    Container(ContainerTemplate),
    Workflow(EmbeddedWorkflow),
    Deployment(EmbeddedDeployment),
}

impl<'de> Deserialize<'de> for EmbeddedTemplate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        EmbeddedTemplate::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl EmbeddedTemplate {
    pub fn from_value(value: Value) -> TemplateResult<Self> {
        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TemplateError::invalid("'type' field required"))?;
        match type_name.parse::<TemplateType>() {
            Ok(TemplateType::Container) => Ok(Self::Container(serde_json::from_value(value)?)),
            Ok(TemplateType::Workflow) => Ok(Self::Workflow(serde_json::from_value(value)?)),
            Ok(TemplateType::Deployment) => Ok(Self::Deployment(serde_json::from_value(value)?)),
            _ => Err(TemplateError::invalid(format!(
                "{type_name} templates cannot be embedded"
            ))),
        }
    }

    pub fn base(&self) -> &BaseTemplate {
        match self {
            Self::Container(t) => &t.base,
            Self::Workflow(t) => &t.base,
            Self::Deployment(t) => &t.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn template_type(&self) -> TemplateType {
        match self {
            Self::Container(_) => TemplateType::Container,
            Self::Workflow(_) => TemplateType::Workflow,
            Self::Deployment(_) => TemplateType::Deployment,
        }
    }

    pub fn inputs(&self) -> &Inputs {
        match self {
            Self::Container(t) => &t.inputs,
            Self::Workflow(t) => &t.inputs,
            Self::Deployment(t) => &t.inputs,
        }
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        match self {
            Self::Container(t) => Some(&t.outputs),
            Self::Workflow(t) => Some(&t.outputs),
            Self::Deployment(_) => None,
        }
    }

    pub fn as_container(&self) -> Option<&ContainerTemplate> {
        match self {
            Self::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&EmbeddedWorkflow> {
        match self {
            Self::Workflow(w) => Some(w),
            _ => None,
        }
    }

    pub fn termination_policy(&self) -> Option<&TerminationPolicy> {
        match self {
            Self::Container(_) => None,
            Self::Workflow(t) => t.termination_policy.as_ref(),
            Self::Deployment(t) => t.termination_policy.as_ref(),
        }
    }

    /// Re-check an embedded tree. With `preprocess` set, steps whose body
    /// is not present yet are accepted.
    pub fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        match self {
            Self::Container(c) => c.validate(preprocess, false),
            Self::Workflow(w) => validate_workflow(w, preprocess),
            Self::Deployment(d) => validate_deployment(d, preprocess),
        }
    }
}

fn validate_slot(
    name: &str,
    slot: &EmbeddedStep,
    scope: &ParamMap,
    preprocess: bool,
) -> TemplateResult<Vec<String>> {
    slot.parsed_flags().map_err(|e| e.at(name))?;
    if slot.executor.is_some() {
        return Ok(Vec::new());
    }
    let Some(child) = slot.template.as_deref() else {
        if preprocess {
            return Ok(Vec::new());
        }
        return Err(TemplateError::invalid("'template' field required").at(name));
    };
    child.validate(preprocess).map_err(|e| e.at(name))?;
    validate_receiver_params(child.name(), Some(child.inputs()), &slot.arguments, scope)
        .map_err(|e| e.at(name))?;
    Ok(child
        .outputs()
        .map(|outputs| outputs.artifacts.keys().cloned().collect())
        .unwrap_or_default())
}

fn fixture_scope(
    fixtures: &[BTreeMap<String, EmbeddedFixture>],
    scope: &mut ParamMap,
    preprocess: bool,
) -> TemplateResult<()> {
    for group in fixtures {
        for (name, fixture) in group {
            if let Some(template) = fixture.template.as_deref() {
                let slot = EmbeddedStep {
                    template: Some(Box::new(template.clone())),
                    arguments: fixture.arguments.clone(),
                    ..Default::default()
                };
                for artifact in validate_slot(name, &slot, scope, preprocess)? {
                    scope.insert(
                        format!("fixtures.{name}.outputs.artifacts.{artifact}"),
                        ParamType::Artifact,
                    );
                }
            }
            scope.insert(format!("fixtures.{name}"), ParamType::Fixture);
        }
    }
    Ok(())
}

fn validate_workflow(workflow: &EmbeddedWorkflow, preprocess: bool) -> TemplateResult<()> {
    workflow.base.validate(true)?;
    workflow.inputs.validate()?;
    let mut scope = workflow.inputs.declared_params();
    for name in workflow.volumes.keys() {
        scope.insert(format!("volumes.{name}"), ParamType::Volume);
    }
    fixture_scope(&workflow.fixtures, &mut scope, preprocess)?;
    for (index, group) in workflow.steps.iter().enumerate() {
        let mut group_outputs = Vec::new();
        for (name, step) in group {
            let outputs = validate_slot(name, step, &scope, preprocess)
                .map_err(|e| e.at(format!("steps[{index}]")))?;
            group_outputs.extend(outputs.into_iter().map(|artifact| {
                format!("steps.{name}.outputs.artifacts.{artifact}")
            }));
        }
        for output in group_outputs {
            scope.insert(output, ParamType::Artifact);
        }
    }
    Ok(())
}

fn validate_deployment(deployment: &EmbeddedDeployment, preprocess: bool) -> TemplateResult<()> {
    deployment.base.validate(true)?;
    deployment.inputs.validate()?;
    if deployment.containers.len() != 1 {
        return Err(TemplateError::invalid(
            "Only one container per deployment is currently supported",
        ));
    }
    let mut scope = deployment.inputs.declared_params();
    for name in deployment.volumes.keys() {
        scope.insert(format!("volumes.{name}"), ParamType::Volume);
    }
    fixture_scope(&deployment.fixtures, &mut scope, preprocess)?;
    for (name, slot) in &deployment.containers {
        validate_slot(name, slot, &scope, preprocess).map_err(|e| e.at("containers"))?;
        if let Some(child) = slot.template.as_deref() {
            if child.template_type() != TemplateType::Container {
                return Err(TemplateError::invalid(format!(
                    "template '{}' must be of type: container",
                    child.name()
                ))
                .at(format!("containers.{name}")));
            }
        }
    }
    Ok(())
}

/// Walks the build context producing embedded templates
struct Embedder<'a> {
    ctx: &'a BuildContext,
    generated: HashSet<String>,
}

impl Embedder<'_> {
    fn unique_name(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut suffix = 1;
        while self.ctx.lookup(&candidate).is_some() || self.generated.contains(&candidate) {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        self.generated.insert(candidate.clone());
        candidate
    }

    fn embed(&mut self, name: &str) -> TemplateResult<EmbeddedTemplate> {
        let template = self.ctx.lookup(name).ok_or_else(|| TemplateError::NotFound {
            name: name.to_string(),
        })?;
        match template.as_ref() {
            Template::Container(c) => Ok(EmbeddedTemplate::Container(c.clone())),
            Template::Workflow(w) => self.embed_workflow(w).map(EmbeddedTemplate::Workflow),
            Template::Deployment(d) => self.embed_deployment(d).map(EmbeddedTemplate::Deployment),
            other => Err(TemplateError::invalid(format!(
                "{} templates cannot be embedded",
                other.template_type()
            ))),
        }
    }

    fn embed_slot(
        &mut self,
        parent: &str,
        slot_name: &str,
        slot: &InlineContainerTemplateRef,
    ) -> TemplateResult<(EmbeddedTemplate, Arguments)> {
        if slot.is_inlined() {
            let generated = self.unique_name(&format!("{parent}-{slot_name}"));
            let (container, arguments) = slot.reverse_inline(&generated)?;
            Ok((EmbeddedTemplate::Container(container), arguments))
        } else {
            let child = self.embed(&slot.template_ref.template)?;
            Ok((child, slot.template_ref.arguments.clone()))
        }
    }

    fn embed_fixtures(
        &mut self,
        fixtures: &[BTreeMap<String, super::types::FixtureRequirement>],
    ) -> TemplateResult<Vec<BTreeMap<String, EmbeddedFixture>>> {
        let mut embedded = Vec::with_capacity(fixtures.len());
        for group in fixtures {
            let mut out = BTreeMap::new();
            for (name, requirement) in group {
                let fixture = if requirement.is_dynamic() {
                    EmbeddedFixture {
                        template: Some(Box::new(self.embed(&requirement.template_ref.template)?)),
                        arguments: requirement.template_ref.arguments.clone(),
                        ..Default::default()
                    }
                } else {
                    EmbeddedFixture {
                        class: requirement.class.clone(),
                        name: requirement.name.clone(),
                        attributes: requirement.attributes.clone(),
                        ..Default::default()
                    }
                };
                out.insert(name.clone(), fixture);
            }
            embedded.push(out);
        }
        Ok(embedded)
    }

    fn embed_workflow(&mut self, workflow: &WorkflowTemplate) -> TemplateResult<EmbeddedWorkflow> {
        let mut steps = Vec::with_capacity(workflow.steps.len());
        for group in &workflow.steps {
            let mut embedded_group = BTreeMap::new();
            for (name, step) in group {
                let embedded = if step.executor.is_some() {
                    EmbeddedStep {
                        template: None,
                        arguments: Arguments::new(),
                        flags: step.flags.clone(),
                        executor: step.executor.clone(),
                    }
                } else {
                    let (template, arguments) =
                        self.embed_slot(&workflow.base.name, name, &step.spec)?;
                    EmbeddedStep {
                        template: Some(Box::new(template)),
                        arguments,
                        flags: step.flags.clone(),
                        executor: None,
                    }
                };
                embedded_group.insert(name.clone(), embedded);
            }
            steps.push(embedded_group);
        }

        Ok(EmbeddedWorkflow {
            base: workflow.base.clone(),
            inputs: workflow.inputs.clone(),
            outputs: workflow.outputs.clone(),
            steps,
            fixtures: self.embed_fixtures(&workflow.fixtures)?,
            volumes: workflow.volumes.clone(),
            artifact_tags: workflow.artifact_tags.clone(),
            termination_policy: workflow.termination_policy.clone(),
        })
    }

    fn embed_deployment(
        &mut self,
        deployment: &DeploymentTemplate,
    ) -> TemplateResult<EmbeddedDeployment> {
        let mut containers = BTreeMap::new();
        for (name, slot) in &deployment.containers {
            let (template, arguments) = self.embed_slot(&deployment.base.name, name, slot)?;
            containers.insert(
                name.clone(),
                EmbeddedStep {
                    template: Some(Box::new(template)),
                    arguments,
                    ..Default::default()
                },
            );
        }
        Ok(EmbeddedDeployment {
            base: deployment.base.clone(),
            inputs: deployment.inputs.clone(),
            application_name: deployment.application_name.clone(),
            deployment_name: deployment.deployment_name.clone(),
            scale: deployment.scale,
            strategy: deployment.strategy.clone(),
            external_routes: deployment.external_routes.clone(),
            internal_routes: deployment.internal_routes.clone(),
            containers,
            fixtures: self.embed_fixtures(&deployment.fixtures)?,
            volumes: deployment.volumes.clone(),
            termination_policy: deployment.termination_policy.clone(),
        })
    }
}

/// Embed the named template. Fixture, policy and project templates cannot be embedded.
pub fn embed_template(ctx: &BuildContext, name: &str) -> TemplateResult<EmbeddedTemplate> {
    let mut embedder = Embedder {
        ctx,
        generated: HashSet::new(),
    };
    embedder.embed(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS: &str = r#"
type: container
version: 1
name: build
image: golang
inputs:
  parameters:
    COMMIT:
command: ["make", "%%inputs.parameters.COMMIT%%"]
outputs:
  artifacts:
    bin:
      path: /out
---
type: workflow
version: 1
name: ci
inputs:
  parameters:
    COMMIT:
      default: master
steps:
  - build:
      template: build
      arguments:
        parameters.COMMIT: "%%inputs.parameters.COMMIT%%"
  - test:
      image: alpine
      command: ["./test", "%%inputs.parameters.COMMIT%%"]
      inputs:
        artifacts:
          bin:
            from: "%%steps.build.outputs.artifacts.bin%%"
            path: /bin
"#;

    #[test]
    fn test_embed_workflow() {
        let mut ctx = BuildContext::new("repo", "main");
        ctx.parse_str("ci.yaml", DOCS).unwrap();
        let embedded = ctx.embed("ci").unwrap();
        embedded.validate(false).unwrap();

        let workflow = embedded.as_workflow().unwrap();
        let build = &workflow.steps[0]["build"];
        assert_eq!(build.template.as_ref().unwrap().name(), "build");

        let test = &workflow.steps[1]["test"];
        let container = test.template.as_ref().unwrap().as_container().unwrap();
        assert_eq!(container.base.name, "ci-test");
        assert_eq!(
            test.arguments["artifacts.bin"],
            "%%steps.build.outputs.artifacts.bin%%"
        );
        assert_eq!(test.arguments["parameters.COMMIT"], "%%inputs.parameters.COMMIT%%");
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut ctx = BuildContext::new("repo", "main");
        ctx.parse_str("ci.yaml", DOCS).unwrap();
        let embedded = ctx.embed("ci").unwrap();
        let value = serde_json::to_value(&embedded).unwrap();
        let decoded: EmbeddedTemplate = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, embedded);
    }

    #[test]
    fn test_fixture_templates_cannot_be_embedded() {
        let mut ctx = BuildContext::new("repo", "main");
        ctx.parse_str("f.yaml", "type: fixture\nversion: 1\nname: vm\n")
            .unwrap();
        assert_eq!(
            ctx.embed("vm").unwrap_err().to_string(),
            "fixture templates cannot be embedded"
        );
    }
}
