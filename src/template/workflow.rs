use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::context::BuildContext;
use super::errors::{TemplateError, TemplateResult};
use super::params::{
    extract_used_params, merge_params, param_name, validate_params, validate_receiver_params,
    ParamMap, ParamType, LIST_EXPANSION_REGEX, OUTPUT_ARTIFACT_REGEX,
};
use super::inline::InlineContainerTemplateRef;
use super::types::{
    validate_reference_name, BaseTemplate, FixtureRequirement, Inputs, Outputs,
    TerminationPolicy, VolumeRequirement,
};
use super::TemplateType;

/// Parsed form of a step's comma separated `flags`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFlags {
    pub ignore_error: bool,
    pub auto_retry: bool,
    pub always_run: bool,
    pub skipped: bool,
}

impl StepFlags {
    pub fn parse(flags: &str) -> TemplateResult<Self> {
        let mut parsed = Self::default();
        for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "ignore_error" => parsed.ignore_error = true,
                "auto_retry" => parsed.auto_retry = true,
                "always_run" => parsed.always_run = true,
                "skipped" => parsed.skipped = true,
                other => return Err(TemplateError::invalid(format!("unknown flag: {other}"))),
            }
        }
        Ok(parsed)
    }
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// Marks a step as executed by an agent instead of a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentExecutor {
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Plugin {
        name: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
    },
}

impl AgentExecutor {
    fn validate(&self) -> TemplateResult<()> {
        match self {
            Self::Http { url, method, .. } => {
                if url.trim().is_empty() {
                    return Err(TemplateError::invalid("executor.url: field required"));
                }
                const METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];
                if !METHODS.contains(&method.to_uppercase().as_str()) {
                    return Err(TemplateError::invalid(format!(
                        "executor.method: unsupported HTTP method '{method}'"
                    )));
                }
            }
            Self::Plugin { name, .. } => {
                if name.trim().is_empty() {
                    return Err(TemplateError::invalid("executor.name: field required"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(flatten)]
    pub spec: InlineContainerTemplateRef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<AgentExecutor>,
}

impl WorkflowStep {
    pub fn parsed_flags(&self) -> TemplateResult<StepFlags> {
        StepFlags::parse(&self.flags)
    }

    fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        self.parsed_flags()?;
        if let Some(executor) = &self.executor {
            if self.spec.is_inlined() || !self.spec.template_ref.template.is_empty() {
                return Err(TemplateError::invalid(
                    "agent steps cannot reference or inline a template",
                ));
            }
            return executor.validate();
        }
        for (arg, value) in &self.spec.template_ref.arguments {
            if LIST_EXPANSION_REGEX.is_match(value) {
                return Err(TemplateError::invalid(format!(
                    "arguments.{arg}: list expansion is not supported"
                )));
            }
        }
        self.spec.validate(preprocess)
    }
}

/// An ordered sequence of parallel step groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<BTreeMap<String, WorkflowStep>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<BTreeMap<String, FixtureRequirement>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

impl WorkflowTemplate {
    /// Structural checks that need no other template
    pub fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        self.base.validate(true)?;
        self.inputs.validate()?;
        if let Some(policy) = &self.termination_policy {
            policy.validate()?;
        }
        if self.steps.is_empty() {
            return Err(TemplateError::invalid("'steps' field required"));
        }

        let mut names = HashSet::new();
        for (index, group) in self.steps.iter().enumerate() {
            let group_path = format!("steps[{index}]");
            if group.is_empty() {
                return Err(TemplateError::invalid("empty step group").at(&group_path));
            }
            if !self.volumes.is_empty() && group.len() > 1 {
                return Err(TemplateError::invalid(
                    "workflows with volumes cannot have parallel steps",
                )
                .at(&group_path));
            }
            for (name, step) in group {
                validate_reference_name("step", name).map_err(|e| e.at(&group_path))?;
                if !names.insert(name.as_str()) {
                    return Err(
                        TemplateError::invalid(format!("duplicated step name '{name}'"))
                            .at(&group_path),
                    );
                }
                let step_path = format!("{group_path}.{name}");
                step.validate(preprocess).map_err(|e| e.at(&step_path))?;
                if step.spec.is_inlined() && !preprocess {
                    step.spec
                        .reverse_inline(&format!("{}-{name}", self.base.name))
                        .map_err(|e| e.at(&step_path))?;
                }
            }
        }

        for (index, group) in self.fixtures.iter().enumerate() {
            let group_path = format!("fixtures[{index}]");
            for (name, requirement) in group {
                validate_reference_name("fixture", name).map_err(|e| e.at(&group_path))?;
                if !names.insert(name.as_str()) {
                    return Err(TemplateError::invalid(format!(
                        "fixture name '{name}' collides with another step or fixture"
                    ))
                    .at(&group_path));
                }
                requirement
                    .validate()
                    .map_err(|e| e.at(format!("{group_path}.{name}")))?;
            }
        }

        for (name, volume) in &self.volumes {
            validate_reference_name("volume", name).map_err(|e| e.at("volumes"))?;
            volume.validate().map_err(|e| e.at(format!("volumes.{name}")))?;
        }

        for (name, artifact) in &self.outputs.artifacts {
            let path = format!("outputs.artifacts.{name}");
            if artifact.path.is_some() {
                return Err(
                    TemplateError::invalid("workflows can only export with 'from'").at(&path),
                );
            }
            let from = artifact
                .from
                .as_deref()
                .ok_or_else(|| TemplateError::invalid("'from' field required").at(&path))?;
            if !OUTPUT_ARTIFACT_REGEX.is_match(from) {
                return Err(TemplateError::invalid(format!(
                    "'from' must be of the form %%steps.<step>.outputs.artifacts.<name>%% or %%fixtures.<fixture>.outputs.artifacts.<name>%%, got '{from}'"
                ))
                .at(&path));
            }
        }
        Ok(())
    }

    /// Checks that need the other templates of the build context: child
    /// references, receiver arguments and the scope built up step by step.
    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        let mut scope = self.inputs.declared_params();
        for name in self.volumes.keys() {
            scope.insert(format!("volumes.{name}"), ParamType::Volume);
        }

        for (index, group) in self.fixtures.iter().enumerate() {
            for (name, requirement) in group {
                let path = format!("fixtures[{index}].{name}");
                if requirement.is_dynamic() {
                    let child = ctx
                        .child(&requirement.template_ref.template, depth + 1)
                        .map_err(|e| e.at(&path))?;
                    if child.template_type() != TemplateType::Container {
                        return Err(TemplateError::invalid(format!(
                            "dynamic fixture template '{}' must be of type: container",
                            child.name()
                        ))
                        .at(&path));
                    }
                    validate_receiver_params(
                        child.name(),
                        child.inputs(),
                        &requirement.template_ref.arguments,
                        &scope,
                    )
                    .map_err(|e| e.at(&path))?;
                    if let Some(outputs) = child.outputs() {
                        for artifact in outputs.artifacts.keys() {
                            scope.insert(
                                format!("fixtures.{name}.outputs.artifacts.{artifact}"),
                                ParamType::Artifact,
                            );
                        }
                    }
                } else {
                    let used = requirement.used_parameters()?;
                    validate_params(&used, &scope).map_err(|e| e.at(&path))?;
                }
                scope.insert(format!("fixtures.{name}"), ParamType::Fixture);
            }
        }

        for (index, group) in self.steps.iter().enumerate() {
            let mut group_outputs = ParamMap::new();
            for (name, step) in group {
                let path = format!("steps[{index}].{name}");
                let outputs = validate_step_context(ctx, step, &scope, depth)
                    .map_err(|e| e.at(&path))?;
                for artifact in outputs {
                    group_outputs.insert(
                        format!("steps.{name}.outputs.artifacts.{artifact}"),
                        ParamType::Artifact,
                    );
                }
            }
            merge_params(&mut scope, &group_outputs)?;
        }

        for (name, artifact) in &self.outputs.artifacts {
            if let Some(source) = artifact.from.as_deref().and_then(param_name) {
                if scope.get(source) != Some(&ParamType::Artifact) {
                    return Err(TemplateError::invalid(format!(
                        "cannot resolve '%%{source}%%'"
                    ))
                    .at(format!("outputs.artifacts.{name}")));
                }
            }
        }

        let mut own = ParamMap::new();
        extract_used_params(&self.volumes, ParamType::String, &mut own)?;
        if let Some(policy) = &self.termination_policy {
            extract_used_params(policy, ParamType::String, &mut own)?;
        }
        validate_params(&own, &scope)
    }
}

/// Returns the names of the output artifacts the step produces
fn validate_step_context(
    ctx: &mut BuildContext,
    step: &WorkflowStep,
    scope: &ParamMap,
    depth: usize,
) -> TemplateResult<Vec<String>> {
    if let Some(executor) = &step.executor {
        let mut used = ParamMap::new();
        extract_used_params(executor, ParamType::String, &mut used)?;
        validate_params(&used, scope)?;
        return Ok(Vec::new());
    }
    if step.spec.is_inlined() {
        validate_params(&step.spec.used_parameters()?, scope)?;
        return Ok(step.spec.container.outputs.artifacts.keys().cloned().collect());
    }

    let child = ctx.child(&step.spec.template_ref.template, depth + 1)?;
    match child.template_type() {
        TemplateType::Container | TemplateType::Workflow | TemplateType::Deployment => {}
        other => {
            return Err(TemplateError::invalid(format!(
                "template '{}' is a {other} but must be of type: container, workflow, deployment",
                child.name()
            )))
        }
    }
    validate_receiver_params(
        child.name(),
        child.inputs(),
        &step.spec.template_ref.arguments,
        scope,
    )?;
    Ok(child
        .outputs()
        .map(|outputs| outputs.artifacts.keys().cloned().collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(value: Value) -> WorkflowTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_flags() {
        let flags = StepFlags::parse("ignore_error, always_run").unwrap();
        assert!(flags.ignore_error && flags.always_run);
        assert!(!flags.skipped);
        assert_eq!(
            StepFlags::parse("sometimes").unwrap_err().to_string(),
            "unknown flag: sometimes"
        );
    }

    #[test]
    fn test_volumes_forbid_parallel_steps() {
        let wf = workflow(json!({
            "type": "workflow", "version": 1, "name": "wf",
            "volumes": {"cache": {"storage_class": "ssd", "size_gb": 10}},
            "steps": [{"a": {"template": "c"}, "b": {"template": "c"}}]
        }));
        assert_eq!(
            wf.validate(false).unwrap_err().to_string(),
            "steps[0]: workflows with volumes cannot have parallel steps"
        );
    }

    #[test]
    fn test_duplicate_step_names() {
        let wf = workflow(json!({
            "type": "workflow", "version": 1, "name": "wf",
            "steps": [{"a": {"template": "c"}}, {"a": {"template": "c"}}]
        }));
        assert_eq!(
            wf.validate(false).unwrap_err().to_string(),
            "steps[1]: duplicated step name 'a'"
        );
    }

    #[test]
    fn test_list_expansion_rejected() {
        let wf = workflow(json!({
            "type": "workflow", "version": 1, "name": "wf",
            "steps": [{"a": {"template": "c", "arguments": {"parameters.X": "$$[1,2]$$"}}}]
        }));
        assert!(wf
            .validate(false)
            .unwrap_err()
            .to_string()
            .contains("list expansion is not supported"));
    }

    #[test]
    fn test_export_requires_from() {
        let wf = workflow(json!({
            "type": "workflow", "version": 1, "name": "wf",
            "steps": [{"a": {"template": "c"}}],
            "outputs": {"artifacts": {"bin": {"path": "/bin"}}}
        }));
        assert_eq!(
            wf.validate(false).unwrap_err().to_string(),
            "outputs.artifacts.bin: workflows can only export with 'from'"
        );
    }

    #[test]
    fn test_agent_step() {
        let wf = workflow(json!({
            "type": "workflow", "version": 1, "name": "wf",
            "steps": [{"notify": {"executor": {"kind": "http", "url": "http://hooks/%%inputs.parameters.ID%%"}}}],
            "inputs": {"parameters": {"ID": null}}
        }));
        wf.validate(false).unwrap();
        let step = &wf.steps[0]["notify"];
        assert!(matches!(
            step.executor,
            Some(AgentExecutor::Http { ref method, .. }) if method == "GET"
        ));
    }
}
