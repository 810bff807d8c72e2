//! Slots that hold either a template reference or an inlined container body,
//! and the reverse-inlining that turns an inlined body into a named container.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::container::ContainerTemplate;
use super::errors::{TemplateError, TemplateResult};
use super::params::{has_global_scope, resolve_variable, ParamMap, ParamType};
use super::types::{Arguments, BaseTemplate, InputParameter, TemplateRef, TemplateType};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InlineContainerTemplateRef {
    #[serde(flatten)]
    pub template_ref: TemplateRef,
    #[serde(flatten)]
    pub container: ContainerTemplate,
}

impl InlineContainerTemplateRef {
    pub fn reference(template_ref: TemplateRef) -> Self {
        Self {
            template_ref,
            container: ContainerTemplate::default(),
        }
    }

    pub fn inlined(container: ContainerTemplate) -> Self {
        Self {
            template_ref: TemplateRef::default(),
            container,
        }
    }

    pub fn is_inlined(&self) -> bool {
        self.container.has_body()
    }

    pub fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        if !self.is_inlined() {
            return self.template_ref.validate();
        }
        if !self.template_ref.template.is_empty() {
            return Err(TemplateError::invalid(
                "cannot specify both 'template' and an inlined container",
            ));
        }
        if !self.template_ref.arguments.is_empty() {
            return Err(TemplateError::invalid(
                "inlined containers cannot take arguments",
            ));
        }
        self.container.validate(preprocess, true)
    }

    /// Parameters this slot needs from the enclosing scope
    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        if self.is_inlined() {
            self.container.used_parameters(true)
        } else {
            self.template_ref.used_parameters()
        }
    }

    /// Turn the inlined body into a standalone container called `name`.
    ///
    /// Input `from` sources become call-site arguments. Any other reference
    /// into the enclosing scope is lifted into a generated input parameter:
    /// `inputs.parameters.Y` keeps its name, everything else is renamed by
    /// replacing dots with underscores. Returns the container and the
    /// arguments to call it with.
    pub fn reverse_inline(&self, name: &str) -> TemplateResult<(ContainerTemplate, Arguments)> {
        let mut container = self.container.clone();
        container.base = BaseTemplate::new(TemplateType::Container, name);
        let mut arguments = Arguments::new();

        for (input, artifact) in container.inputs.artifacts.iter_mut() {
            if let Some(from) = artifact.from.take() {
                arguments.insert(format!("artifacts.{input}"), from);
            }
        }
        for (input, volume) in container.inputs.volumes.iter_mut() {
            if let Some(from) = volume.from.take() {
                arguments.insert(format!("volumes.{input}"), from);
            }
        }

        let declared = container.inputs.declared_params();
        let used = container.used_parameters(false)?;
        let mut renames: Vec<(String, String)> = Vec::new();

        for (param, param_type) in &used {
            if has_global_scope(param) || resolve_variable(&declared, param).is_some() {
                continue;
            }
            if *param_type == ParamType::Fixture {
                return Err(TemplateError::invalid(format!(
                    "Parameter usages of type fixture (%%{param}%%) not yet supported"
                )));
            }
            if let Some(parent_input) = param.strip_prefix("inputs.parameters.") {
                if !parent_input.contains('.') {
                    container
                        .inputs
                        .parameters
                        .insert(parent_input.to_string(), InputParameter::default());
                    arguments.insert(
                        format!("parameters.{parent_input}"),
                        format!("%%{param}%%"),
                    );
                    continue;
                }
            }

            let base_name = param.replace('.', "_");
            let mut generated = base_name.clone();
            let mut suffix = 1;
            while container.inputs.parameters.contains_key(&generated) {
                generated = format!("{base_name}-{suffix}");
                suffix += 1;
            }
            container
                .inputs
                .parameters
                .insert(generated.clone(), InputParameter::default());
            arguments.insert(format!("parameters.{generated}"), format!("%%{param}%%"));
            renames.push((param.clone(), generated));
        }

        if !renames.is_empty() {
            // longest names first so a rename never rewrites part of another
            renames.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
            let inputs = std::mem::take(&mut container.inputs);
            let mut body = serde_json::to_string(&container)?;
            for (old, new) in &renames {
                let pattern = Regex::new(&format!(
                    r"%%{}((?:\.[-0-9A-Za-z_]+)*)%%",
                    regex::escape(old)
                ))
                .map_err(|e| TemplateError::internal(e.to_string()))?;
                body = pattern
                    .replace_all(&body, format!("%%inputs.parameters.{new}${{1}}%%").as_str())
                    .into_owned();
            }
            container = serde_json::from_str(&body)?;
            container.inputs = inputs;
        }

        container
            .validate(false, false)
            .map_err(|e| TemplateError::internal(format!("Failed to reverse inline: {e}")))?;
        Ok((container, arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_or_inline() {
        let slot: InlineContainerTemplateRef = serde_json::from_value(json!({
            "template": "build",
            "arguments": {"parameters.COMMIT": "%%inputs.parameters.COMMIT%%"}
        }))
        .unwrap();
        assert!(!slot.is_inlined());
        slot.validate(false).unwrap();

        let both: InlineContainerTemplateRef =
            serde_json::from_value(json!({"template": "build", "image": "alpine"})).unwrap();
        assert!(both.is_inlined());
        assert!(both.validate(false).is_err());
    }

    #[test]
    fn test_reverse_inline_lifts_scope_references() {
        let slot: InlineContainerTemplateRef = serde_json::from_value(json!({
            "image": "alpine",
            "command": ["sh", "-c", "psql -h %%fixtures.db.host%% -c %%inputs.parameters.QUERY%%"],
            "inputs": {
                "artifacts": {"data": {"from": "%%steps.fetch.outputs.artifacts.data%%", "path": "/data"}}
            }
        }))
        .unwrap();
        let (container, arguments) = slot.reverse_inline("pipeline-query").unwrap();

        assert_eq!(container.base.name, "pipeline-query");
        assert!(container.inputs.artifacts["data"].from.is_none());
        assert!(container.inputs.parameters.contains_key("QUERY"));
        assert!(container.inputs.parameters.contains_key("fixtures_db_host"));
        assert_eq!(
            arguments["artifacts.data"],
            "%%steps.fetch.outputs.artifacts.data%%"
        );
        assert_eq!(arguments["parameters.QUERY"], "%%inputs.parameters.QUERY%%");
        assert_eq!(
            arguments["parameters.fixtures_db_host"],
            "%%fixtures.db.host%%"
        );
        assert_eq!(
            container.command[2],
            "psql -h %%inputs.parameters.fixtures_db_host%% -c %%inputs.parameters.QUERY%%"
        );
    }

    #[test]
    fn test_reverse_inline_name_collision() {
        let slot: InlineContainerTemplateRef = serde_json::from_value(json!({
            "image": "alpine",
            "command": ["echo", "%%fixtures.db.host%%", "%%inputs.parameters.fixtures_db_host%%"],
            "inputs": {"parameters": {"fixtures_db_host": null}}
        }))
        .unwrap();
        let (container, arguments) = slot.reverse_inline("x").unwrap();
        assert!(container.inputs.parameters.contains_key("fixtures_db_host-1"));
        assert_eq!(
            arguments["parameters.fixtures_db_host-1"],
            "%%fixtures.db.host%%"
        );
    }
}
