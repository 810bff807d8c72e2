use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::container::ContainerTemplate;
use super::context::BuildContext;
use super::deployment::DeploymentTemplate;
use super::errors::{TemplateError, TemplateResult};
use super::fixture::FixtureTemplate;
use super::policy::{PolicyTemplate, ProjectTemplate};
use super::types::{BaseTemplate, Inputs, Outputs, TemplateType};
use super::workflow::WorkflowTemplate;

/// Any parsed template, routed by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Template {
    Container(ContainerTemplate),
    Workflow(WorkflowTemplate),
    Deployment(DeploymentTemplate),
    Fixture(FixtureTemplate),
    Policy(PolicyTemplate),
    Project(ProjectTemplate),
}

impl Template {
    /// Decode a document, reading `type` first to pick the body
    pub fn from_value(value: Value) -> TemplateResult<Self> {
        let type_name = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TemplateError::invalid("'type' field required"))?;
        let template_type: TemplateType = type_name
            .parse()
            .map_err(|_| TemplateError::invalid(format!("unknown template type '{type_name}'")))?;

        let decode_err = |e: serde_json::Error| TemplateError::invalid(e.to_string());
        let template = match template_type {
            TemplateType::Container => {
                Self::Container(serde_json::from_value(value).map_err(decode_err)?)
            }
            TemplateType::Workflow => {
                Self::Workflow(serde_json::from_value(value).map_err(decode_err)?)
            }
            TemplateType::Deployment => {
                Self::Deployment(serde_json::from_value(value).map_err(decode_err)?)
            }
            TemplateType::Fixture => {
                Self::Fixture(serde_json::from_value(value).map_err(decode_err)?)
            }
            TemplateType::Policy => Self::Policy(serde_json::from_value(value).map_err(decode_err)?),
            TemplateType::Project => {
                Self::Project(serde_json::from_value(value).map_err(decode_err)?)
            }
        };
        Ok(template)
    }

    pub fn base(&self) -> &BaseTemplate {
        match self {
            Self::Container(t) => &t.base,
            Self::Workflow(t) => &t.base,
            Self::Deployment(t) => &t.base,
            Self::Fixture(t) => &t.base,
            Self::Policy(t) => &t.base,
            Self::Project(t) => &t.base,
        }
    }

    pub fn template_type(&self) -> TemplateType {
        match self {
            Self::Container(_) => TemplateType::Container,
            Self::Workflow(_) => TemplateType::Workflow,
            Self::Deployment(_) => TemplateType::Deployment,
            Self::Fixture(_) => TemplateType::Fixture,
            Self::Policy(_) => TemplateType::Policy,
            Self::Project(_) => TemplateType::Project,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn inputs(&self) -> Option<&Inputs> {
        match self {
            Self::Container(t) => Some(&t.inputs),
            Self::Workflow(t) => Some(&t.inputs),
            Self::Deployment(t) => Some(&t.inputs),
            _ => None,
        }
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        match self {
            Self::Container(t) => Some(&t.outputs),
            Self::Workflow(t) => Some(&t.outputs),
            _ => None,
        }
    }

    pub fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        match self {
            Self::Container(t) => t.validate(preprocess, false),
            Self::Workflow(t) => t.validate(preprocess),
            Self::Deployment(t) => t.validate(preprocess),
            Self::Fixture(t) => t.validate(),
            Self::Policy(t) => t.validate(),
            Self::Project(t) => t.validate(),
        }
    }

    /// Checks against the rest of the build context. Containers have none.
    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        match self {
            Self::Container(_) => Ok(()),
            Self::Workflow(t) => t.validate_context(ctx, depth),
            Self::Deployment(t) => t.validate_context(ctx, depth),
            Self::Fixture(t) => t.validate_context(ctx, depth),
            Self::Policy(t) => t.validate_context(ctx, depth),
            Self::Project(t) => t.validate_context(ctx, depth),
        }
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Template::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Paths of fields present in `original` but dropped by the typed decode.
/// Null and empty values are not reported.
pub(crate) fn unknown_fields(original: &Value, typed: &Value, path: &str) -> Vec<String> {
    let mut unknown = Vec::new();
    match (original, typed) {
        (Value::Object(original), Value::Object(typed)) => {
            for (key, value) in original {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match typed.get(key) {
                    Some(typed_value) => {
                        unknown.extend(unknown_fields(value, typed_value, &child_path))
                    }
                    None if is_empty_value(value) => {}
                    None => unknown.push(child_path),
                }
            }
        }
        (Value::Array(original), Value::Array(typed)) => {
            for (index, (value, typed_value)) in original.iter().zip(typed.iter()).enumerate() {
                unknown.extend(unknown_fields(value, typed_value, &format!("{path}[{index}]")));
            }
        }
        _ => {}
    }
    unknown
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.values().all(is_empty_value),
        _ => false,
    }
}
