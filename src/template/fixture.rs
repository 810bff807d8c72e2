use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use super::context::BuildContext;
use super::errors::{TemplateError, TemplateResult};
use super::params::{
    validate_receiver_params, validate_receiver_params_partial, ParamMap, ParamType,
};
use super::types::{de, validate_reference_name, BaseTemplate, TemplateRef};
use super::TemplateType;

static ATTRIBUTE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][0-9a-z_]*$").expect("Valid regex pattern"));

/// Attribute names every fixture instance carries implicitly
pub const RESERVED_ATTRIBUTES: [&str; 7] = [
    "id",
    "name",
    "description",
    "class",
    "class_id",
    "class_name",
    "status",
];

/// Actions that receive full parameter resolution
const LIFECYCLE_ACTIONS: [&str; 2] = ["create", "delete"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[default]
    String,
    Int,
    Bool,
    Float,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Float => write!(f, "float"),
        }
    }
}

impl AttributeType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Float => value.is_number(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeFlags {
    pub required: bool,
    pub array: bool,
}

impl AttributeFlags {
    pub fn parse(flags: &str) -> TemplateResult<Self> {
        let mut parsed = Self::default();
        for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "required" => parsed.required = true,
                "array" => parsed.array = true,
                other => {
                    return Err(TemplateError::invalid(format!(
                        "unknown attribute flag: {other}"
                    )))
                }
            }
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureAttribute {
    #[serde(rename = "type", default)]
    pub attribute_type: AttributeType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flags: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FixtureAttribute {
    fn validate(&self, name: &str) -> TemplateResult<()> {
        if !ATTRIBUTE_NAME_REGEX.is_match(name) {
            return Err(TemplateError::invalid(format!(
                "attribute name '{name}' must match {}",
                ATTRIBUTE_NAME_REGEX.as_str()
            )));
        }
        if RESERVED_ATTRIBUTES.contains(&name) {
            return Err(TemplateError::invalid(format!(
                "attribute name '{name}' is reserved"
            )));
        }
        let flags = AttributeFlags::parse(&self.flags)?;
        if let Some(default) = &self.default {
            let matches = if flags.array {
                default
                    .as_array()
                    .map(|items| items.iter().all(|v| self.attribute_type.accepts(v)))
                    .unwrap_or(false)
            } else {
                self.attribute_type.accepts(default)
            };
            if !matches {
                let expected = if flags.array {
                    format!("array of {}", self.attribute_type)
                } else {
                    self.attribute_type.to_string()
                };
                return Err(TemplateError::invalid(format!(
                    "default value for attribute '{name}' must be of type {expected}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionToggle {
    Enable,
    Disable,
}

/// A fixture action: a template run against an instance, plus the state
/// change applied to the instance when it finishes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureAction {
    #[serde(flatten)]
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<ActionToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<ActionToggle>,
}

/// A class of managed fixtures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub attributes: BTreeMap<String, FixtureAttribute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, FixtureAction>,
}

impl FixtureTemplate {
    pub fn validate(&self) -> TemplateResult<()> {
        self.base.validate(true)?;
        for (name, attribute) in &self.attributes {
            attribute
                .validate(name)
                .map_err(|e| e.at("attributes"))?;
        }
        for (name, action) in &self.actions {
            validate_reference_name("action", name).map_err(|e| e.at("actions"))?;
            action
                .template_ref
                .validate()
                .map_err(|e| e.at(format!("actions.{name}")))?;
        }
        Ok(())
    }

    /// Every attribute, declared or reserved, as `attributes.NAME`
    pub fn attribute_scope(&self) -> ParamMap {
        RESERVED_ATTRIBUTES
            .iter()
            .map(|name| name.to_string())
            .chain(self.attributes.keys().cloned())
            .map(|name| (format!("attributes.{name}"), ParamType::String))
            .collect()
    }

    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        let scope = self.attribute_scope();
        for (name, action) in &self.actions {
            let path = format!("actions.{name}");
            let child = ctx
                .child(&action.template_ref.template, depth + 1)
                .map_err(|e| e.at(&path))?;
            if !matches!(
                child.template_type(),
                TemplateType::Workflow | TemplateType::Container
            ) {
                return Err(TemplateError::invalid(format!(
                    "template '{}' must be of type: workflow, container",
                    child.name()
                ))
                .at(&path));
            }
            let arguments = &action.template_ref.arguments;
            let result = if LIFECYCLE_ACTIONS.contains(&name.as_str()) {
                validate_receiver_params(child.name(), child.inputs(), arguments, &scope)
            } else {
                validate_receiver_params_partial(child.name(), child.inputs(), arguments, &scope)
                    .map(|_| ())
            };
            result.map_err(|e| e.at(&path))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(value: Value) -> FixtureTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_attribute_rules() {
        let f = fixture(json!({
            "type": "fixture", "version": 1, "name": "vm",
            "attributes": {
                "cpus": {"type": "int", "flags": "required", "default": 2},
                "tags": {"type": "string", "flags": "array", "default": ["a", "b"]},
                "ready": {"type": "bool"}
            },
            "actions": {"create": {"template": "make-vm", "on_success": "enable"}}
        }));
        f.validate().unwrap();
        assert_eq!(
            f.actions["create"].on_success,
            Some(ActionToggle::Enable)
        );

        let f = fixture(json!({
            "type": "fixture", "version": 1, "name": "vm",
            "attributes": {"status": {"type": "string"}}
        }));
        assert_eq!(
            f.validate().unwrap_err().to_string(),
            "attributes: attribute name 'status' is reserved"
        );

        let f = fixture(json!({
            "type": "fixture", "version": 1, "name": "vm",
            "attributes": {"cpus": {"type": "int", "default": "two"}}
        }));
        assert_eq!(
            f.validate().unwrap_err().to_string(),
            "attributes: default value for attribute 'cpus' must be of type int"
        );
    }

    #[test]
    fn test_attribute_scope_includes_reserved() {
        let f = fixture(json!({
            "type": "fixture", "version": 1, "name": "vm",
            "attributes": {"cpus": null}
        }));
        let scope = f.attribute_scope();
        assert!(scope.contains_key("attributes.cpus"));
        assert!(scope.contains_key("attributes.name"));
    }
}
