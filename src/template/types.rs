//! Building blocks shared by every template kind: the base header, inputs,
//! outputs, template references and the lenient scalar decoders.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::errors::{TemplateError, TemplateResult};
use super::params::{
    extract_from_str, insert_param, ParamMap, ParamType, ARG_NAME_REGEX, PARAM_NAME_REGEX,
};
use crate::artifacts::{ArchiveMode, ArtifactGcStrategy};
use crate::constants::SUPPORTED_TEMPLATE_VERSION;

/// Template kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    Container,
    Workflow,
    Deployment,
    Fixture,
    Policy,
    Project,
}

impl TemplateType {
    /// Order in which a build context validates kinds
    pub const VALIDATION_ORDER: [TemplateType; 6] = [
        TemplateType::Container,
        TemplateType::Deployment,
        TemplateType::Workflow,
        TemplateType::Fixture,
        TemplateType::Policy,
        TemplateType::Project,
    ];
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Workflow => write!(f, "workflow"),
            Self::Deployment => write!(f, "deployment"),
            Self::Fixture => write!(f, "fixture"),
            Self::Policy => write!(f, "policy"),
            Self::Project => write!(f, "project"),
        }
    }
}

impl FromStr for TemplateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "workflow" => Ok(Self::Workflow),
            "deployment" => Ok(Self::Deployment),
            "fixture" => Ok(Self::Fixture),
            "policy" => Ok(Self::Policy),
            "project" => Ok(Self::Project),
            _ => Err(format!("Invalid template type: {s}")),
        }
    }
}

/// Argument name (`parameters.X`, `artifacts.Y`) to value
pub type Arguments = BTreeMap<String, String>;

/// Header common to all templates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseTemplate {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub template_type: Option<TemplateType>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl BaseTemplate {
    pub fn new(template_type: TemplateType, name: impl Into<String>) -> Self {
        Self {
            template_type: Some(template_type),
            name: name.into(),
            version: Some(SUPPORTED_TEMPLATE_VERSION),
            description: None,
            labels: BTreeMap::new(),
        }
    }

    /// Named templates need a name and a supported version; inlined bodies need neither
    pub fn validate(&self, named: bool) -> TemplateResult<()> {
        if named {
            if self.name.trim().is_empty() {
                return Err(TemplateError::invalid("'name' field required"));
            }
            if self.name.contains("%%") {
                return Err(TemplateError::invalid(format!(
                    "template name '{}' cannot contain parameters",
                    self.name
                )));
            }
            match self.version {
                None => return Err(TemplateError::invalid("'version' field required")),
                Some(v) if v != SUPPORTED_TEMPLATE_VERSION => {
                    return Err(TemplateError::invalid(format!(
                        "unsupported template version {v}"
                    )))
                }
                Some(_) => {}
            }
        } else if !self.name.is_empty() {
            return Err(TemplateError::invalid(
                "inlined templates cannot specify a 'name'",
            ));
        }
        Ok(())
    }
}

/// Reference names must be plain identifiers
pub fn validate_reference_name(kind: &str, name: &str) -> TemplateResult<()> {
    if PARAM_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(TemplateError::invalid(format!(
            "invalid {kind} name '{name}': must match {}",
            PARAM_NAME_REGEX.as_str()
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputArtifact {
    /// Source artifact when the container is inlined into a step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Where the contents appear inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputFixture {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared inputs, four disjoint maps keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub parameters: BTreeMap<String, InputParameter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub artifacts: BTreeMap<String, InputArtifact>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub volumes: BTreeMap<String, InputVolume>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub fixtures: BTreeMap<String, InputFixture>,
}

impl Inputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self.artifacts.is_empty()
            && self.volumes.is_empty()
            && self.fixtures.is_empty()
    }

    /// Declared inputs as scoped parameter names (`inputs.parameters.X`)
    pub fn declared_params(&self) -> ParamMap {
        let mut declared = ParamMap::new();
        let sections: [(&str, ParamType, Vec<&String>); 4] = [
            ("parameters", ParamType::String, self.parameters.keys().collect()),
            ("artifacts", ParamType::Artifact, self.artifacts.keys().collect()),
            ("volumes", ParamType::Volume, self.volumes.keys().collect()),
            ("fixtures", ParamType::Fixture, self.fixtures.keys().collect()),
        ];
        for (section, param_type, names) in sections {
            for name in names {
                declared.insert(format!("inputs.{section}.{name}"), param_type);
            }
        }
        declared
    }

    /// Default of a parameter addressed by argument name (`parameters.X`)
    pub fn default_for(&self, arg_name: &str) -> Option<&str> {
        let name = arg_name.strip_prefix("parameters.")?;
        self.parameters.get(name)?.default.as_deref()
    }

    /// Parameters referenced by the input declarations themselves
    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        let mut used = ParamMap::new();
        for artifact in self.artifacts.values() {
            if let Some(from) = &artifact.from {
                extract_from_str(from, ParamType::Artifact, &mut used)?;
            }
        }
        for volume in self.volumes.values() {
            if let Some(from) = &volume.from {
                extract_from_str(from, ParamType::Volume, &mut used)?;
            }
        }
        Ok(used)
    }

    pub fn validate(&self) -> TemplateResult<()> {
        let mut seen = std::collections::HashSet::new();
        let names = self
            .parameters
            .keys()
            .chain(self.artifacts.keys())
            .chain(self.volumes.keys())
            .chain(self.fixtures.keys());
        for name in names {
            validate_reference_name("input", name).map_err(|e| e.at("inputs"))?;
            if !seen.insert(name.as_str()) {
                return Err(
                    TemplateError::invalid(format!("input '{name}' declared more than once"))
                        .at("inputs"),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_gc: Option<ArtifactGcStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::nullable_map")]
    pub artifacts: BTreeMap<String, OutputArtifact>,
}

impl Outputs {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        let mut used = ParamMap::new();
        for artifact in self.artifacts.values() {
            if let Some(path) = &artifact.path {
                extract_from_str(path, ParamType::String, &mut used)?;
            }
            if let Some(from) = &artifact.from {
                extract_from_str(from, ParamType::Artifact, &mut used)?;
            }
        }
        Ok(used)
    }
}

/// A reference to another template by name, plus the arguments it is called with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::arguments")]
    pub arguments: Arguments,
}

impl TemplateRef {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            arguments: Arguments::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> TemplateResult<()> {
        if self.template.trim().is_empty() {
            return Err(TemplateError::invalid("'template' field required"));
        }
        validate_arguments(&self.arguments)
    }

    /// Parameters referenced by argument values, typed by argument prefix
    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        arguments_used_parameters(&self.arguments)
    }
}

pub fn validate_arguments(arguments: &Arguments) -> TemplateResult<()> {
    for name in arguments.keys() {
        if !ARG_NAME_REGEX.is_match(name) {
            let last = name.rsplit('.').next().unwrap_or(name);
            return Err(TemplateError::invalid(format!(
                "argument '{name}' not of the expected format: <input_type>.<input_name> (e.g. 'parameters.{last}')"
            )));
        }
    }
    Ok(())
}

pub fn arguments_used_parameters(arguments: &Arguments) -> TemplateResult<ParamMap> {
    let mut used = ParamMap::new();
    for (name, value) in arguments {
        let param_type = ParamType::from_argument_name(name);
        let mut found = ParamMap::new();
        extract_from_str(value, ParamType::String, &mut found)?;
        for param in found.keys() {
            // a string may embed several references but non-string arguments are whole values
            let used_type = if super::params::is_param(value) {
                param_type
            } else {
                ParamType::String
            };
            insert_param(&mut used, param, used_type)?;
        }
    }
    Ok(used)
}

/// Spending and wall-clock budget
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminationPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub spending_cents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub time_seconds: Option<String>,
}

impl TerminationPolicy {
    pub fn validate(&self) -> TemplateResult<()> {
        for (field, value) in [
            ("spending_cents", &self.spending_cents),
            ("time_seconds", &self.time_seconds),
        ] {
            if let Some(value) = value {
                if !super::params::is_param(value) && value.parse::<u64>().is_err() {
                    return Err(TemplateError::invalid(format!(
                        "{field} must be a non-negative integer, got '{value}'"
                    ))
                    .at("termination_policy"));
                }
            }
        }
        Ok(())
    }

    pub fn spending_limit_cents(&self) -> Option<u64> {
        self.spending_cents.as_deref()?.parse().ok()
    }

    pub fn time_limit_seconds(&self) -> Option<u64> {
        self.time_seconds.as_deref()?.parse().ok()
    }
}

/// A volume either named (pre-existing) or anonymous (created per run)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub size_gb: Option<String>,
}

impl VolumeRequirement {
    pub fn validate(&self) -> TemplateResult<()> {
        match (&self.name, &self.storage_class) {
            (Some(_), Some(_)) | (None, None) => Err(TemplateError::invalid(
                "requirement should either supply a 'name' or 'storage_class'",
            )),
            (None, Some(_)) if self.size_gb.is_none() => Err(TemplateError::invalid(
                "anonymous volumes require 'size_gb'",
            )),
            _ => Ok(()),
        }
    }

    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        let mut used = ParamMap::new();
        for value in [&self.name, &self.storage_class, &self.size_gb]
            .into_iter()
            .flatten()
        {
            extract_from_str(value, ParamType::String, &mut used)?;
        }
        Ok(used)
    }
}

/// Requirement for a fixture: managed (class + attribute filter) or dynamic
/// (a container template that provides the fixture for the workflow's lifetime)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureRequirement {
    #[serde(flatten)]
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "de::arguments")]
    pub attributes: BTreeMap<String, String>,
}

impl FixtureRequirement {
    pub fn is_dynamic(&self) -> bool {
        !self.template_ref.template.is_empty()
    }

    pub fn validate(&self) -> TemplateResult<()> {
        if self.is_dynamic() {
            if self.class.is_some() || self.name.is_some() || !self.attributes.is_empty() {
                return Err(TemplateError::invalid(
                    "dynamic fixtures cannot specify class, name or attributes",
                ));
            }
            return self.template_ref.validate();
        }
        if self.class.is_none() && self.name.is_none() {
            return Err(TemplateError::invalid(
                "managed fixture requirement must supply a 'class' or 'name'",
            ));
        }
        Ok(())
    }

    pub fn used_parameters(&self) -> TemplateResult<ParamMap> {
        if self.is_dynamic() {
            return self.template_ref.used_parameters();
        }
        let mut used = ParamMap::new();
        for value in self
            .attributes
            .values()
            .chain(self.class.iter())
            .chain(self.name.iter())
        {
            extract_from_str(value, ParamType::String, &mut used)?;
        }
        Ok(used)
    }
}

/// Lenient decoders for hand-written YAML
pub(crate) mod de {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    impl From<Scalar> for String {
        fn from(value: Scalar) -> Self {
            match value {
                Scalar::Str(s) => s,
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(f) => f.to_string(),
                Scalar::Bool(b) => b.to_string(),
            }
        }
    }

    /// Numbers are accepted wherever a parameterizable string is expected
    pub fn opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(String::from))
    }

    /// `name:` with no value decodes as the default entry
    pub fn nullable_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Default,
    {
        let raw = Option::<BTreeMap<String, Option<T>>>::deserialize(deserializer)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect())
    }

    /// Argument values may be numbers or booleans; null becomes the empty string
    pub fn arguments<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<BTreeMap<String, Option<Scalar>>>::deserialize(deserializer)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.map(String::from).unwrap_or_default()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nullable_inputs_decode() {
        let inputs: Inputs = serde_json::from_value(json!({
            "parameters": {"A": null, "B": {"default": 3}},
            "artifacts": {"bin": {"path": "/bin"}}
        }))
        .unwrap();
        assert_eq!(inputs.parameters["A"], InputParameter::default());
        assert_eq!(inputs.parameters["B"].default.as_deref(), Some("3"));
        assert_eq!(inputs.default_for("parameters.B"), Some("3"));

        let declared = inputs.declared_params();
        assert_eq!(declared["inputs.parameters.A"], ParamType::String);
        assert_eq!(declared["inputs.artifacts.bin"], ParamType::Artifact);
    }

    #[test]
    fn test_base_template_checks() {
        let mut base = BaseTemplate::new(TemplateType::Container, "build");
        assert!(base.validate(true).is_ok());
        assert!(base.validate(false).is_err());
        base.version = Some(7);
        assert_eq!(
            base.validate(true).unwrap_err().to_string(),
            "unsupported template version 7"
        );
    }

    #[test]
    fn test_template_ref_argument_format() {
        let tref = TemplateRef::new("child").with_argument("COMMIT", "abc");
        assert_eq!(
            tref.validate().unwrap_err().to_string(),
            "argument 'COMMIT' not of the expected format: <input_type>.<input_name> (e.g. 'parameters.COMMIT')"
        );
        assert_eq!(
            TemplateRef::default().validate().unwrap_err().to_string(),
            "'template' field required"
        );
    }

    #[test]
    fn test_argument_usage_types() {
        let tref = TemplateRef::new("child")
            .with_argument("artifacts.bin", "%%steps.build.outputs.artifacts.bin%%")
            .with_argument("parameters.msg", "hello %%inputs.parameters.NAME%%");
        let used = tref.used_parameters().unwrap();
        assert_eq!(
            used["steps.build.outputs.artifacts.bin"],
            ParamType::Artifact
        );
        assert_eq!(used["inputs.parameters.NAME"], ParamType::String);
    }

    #[test]
    fn test_volume_requirement() {
        let named = VolumeRequirement {
            name: Some("cache".into()),
            ..Default::default()
        };
        assert!(named.validate().is_ok());
        assert!(VolumeRequirement::default().validate().is_err());
    }
}
