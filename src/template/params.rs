//! Parameter scoping.
//!
//! Parameters are written `%%scope.name%%`. Every template computes the map of
//! parameters it *uses* and the map it *declares*; validation checks the former
//! against the latter, with types that must agree.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use super::errors::{TemplateError, TemplateResult};
use super::types::{Arguments, Inputs};

/// Any parameter reference inside a larger string
pub static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%%[-0-9A-Za-z_]+(\.[-0-9A-Za-z_]+)*%%").expect("Valid regex pattern")
});

/// A string that is exactly one parameter reference
pub static EXACT_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%%([-0-9A-Za-z_]+(\.[-0-9A-Za-z_]+)*)%%$").expect("Valid regex pattern")
});

/// Names of inputs, steps, volumes and fixtures
pub static PARAM_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-0-9A-Za-z_]+$").expect("Valid regex pattern"));

/// Workflow export sources
pub static OUTPUT_ARTIFACT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%%(steps|fixtures)\.[-0-9A-Za-z_]+\.outputs\.artifacts\.[-0-9A-Za-z_]+%%$")
        .expect("Valid regex pattern")
});

/// `%%config.<name>.<key>.<field>%%`
pub static CONFIG_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%%config\.([^ %,:]+)\.([-0-9A-Za-z]+)\.([-0-9A-Za-z]+)%%$")
        .expect("Valid regex pattern")
});

/// `%%artifacts.tag.<tag>.<name>%%`
pub static ARTIFACT_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%%artifacts\.tag\.([-0-9A-Za-z_]+)\.([-0-9A-Za-z_]+)%%$")
        .expect("Valid regex pattern")
});

/// `%%service.<step>.outputs.<kind>.<name>%%`
pub static SERVICE_OUTPUT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%%service\.([-0-9A-Za-z_]+)\.outputs\.([-0-9A-Za-z_]+)\.([-0-9A-Za-z_]+)%%$")
        .expect("Valid regex pattern")
});

/// Argument keys: `<input_type>.<input_name>`
pub static ARG_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-0-9A-Za-z_]+\.[-0-9A-Za-z_]+$").expect("Valid regex pattern")
});

/// `$$[a,b,c]$$` list expansion, not supported in step arguments
pub static LIST_EXPANSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$\[(.*)\]\$\$").expect("Valid regex pattern"));

/// Defaults that must always be supplied explicitly by the caller
const SESSION_DEFAULTS: [&str; 2] = ["%%session.commit%%", "%%session.repo%%"];

/// Parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Artifact,
    Volume,
    Fixture,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Artifact => write!(f, "artifact"),
            Self::Volume => write!(f, "volume"),
            Self::Fixture => write!(f, "fixture"),
        }
    }
}

impl ParamType {
    /// Type implied by an argument key prefix (`artifacts.bin` is an artifact)
    pub fn from_argument_name(name: &str) -> ParamType {
        match name.split('.').next() {
            Some("artifacts") => ParamType::Artifact,
            Some("volumes") => ParamType::Volume,
            Some("fixtures") => ParamType::Fixture,
            _ => ParamType::String,
        }
    }
}

/// Parameter name (without `%%`) to type
pub type ParamMap = BTreeMap<String, ParamType>;

/// True when `value` is exactly one `%%...%%` reference
pub fn is_param(value: &str) -> bool {
    EXACT_VAR_REGEX.is_match(value)
}

/// The inner name of an exact parameter reference
pub fn param_name(value: &str) -> Option<&str> {
    EXACT_VAR_REGEX
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Config, artifact-tag and service-output references never need declaring
pub fn has_global_scope(name: &str) -> bool {
    let wrapped = format!("%%{name}%%");
    CONFIG_VAR_REGEX.is_match(&wrapped)
        || ARTIFACT_TAG_REGEX.is_match(&wrapped)
        || SERVICE_OUTPUT_REGEX.is_match(&wrapped)
}

/// Record `name` as used with `param_type`, rejecting conflicting usages
pub fn insert_param(params: &mut ParamMap, name: &str, param_type: ParamType) -> TemplateResult<()> {
    match params.get(name) {
        Some(existing) if *existing != param_type => Err(TemplateError::invalid(format!(
            "parameter '{name}' used as both a {existing} and {param_type}"
        ))),
        Some(_) => Ok(()),
        None => {
            params.insert(name.to_string(), param_type);
            Ok(())
        }
    }
}

/// Scan a string for parameter references
pub fn extract_from_str(value: &str, param_type: ParamType, into: &mut ParamMap) -> TemplateResult<()> {
    for found in VAR_REGEX.find_iter(value) {
        let name = found.as_str().trim_matches('%');
        insert_param(into, name, param_type)?;
    }
    Ok(())
}

/// Serialize `value` and scan the result for parameter references
pub fn extract_used_params<T: Serialize + ?Sized>(
    value: &T,
    param_type: ParamType,
    into: &mut ParamMap,
) -> TemplateResult<()> {
    let serialized = serde_json::to_string(value)?;
    extract_from_str(&serialized, param_type, into)
}

/// Merge `other` into `into`, rejecting conflicting types
pub fn merge_params(into: &mut ParamMap, other: &ParamMap) -> TemplateResult<()> {
    for (name, param_type) in other {
        insert_param(into, name, *param_type)?;
    }
    Ok(())
}

/// Look up a used name in the declared scope
///
/// Attributes of a declared fixture (`fixtures.X.attr`, `inputs.fixtures.X.attr`)
/// resolve as strings.
pub fn resolve_variable(declared: &ParamMap, name: &str) -> Option<ParamType> {
    if let Some(found) = declared.get(name) {
        return Some(*found);
    }
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() >= 4 && parts[0] == "inputs" && parts[1] == "fixtures" {
        let fixture = format!("inputs.fixtures.{}", parts[2]);
        if declared.contains_key(&fixture) {
            return Some(ParamType::String);
        }
    }
    if parts.len() == 4 && parts[0] == "inputs" {
        let attribute = match parts[1] {
            "artifacts" => "path",
            "volumes" => "mount_path",
            _ => "",
        };
        let input = format!("inputs.{}.{}", parts[1], parts[2]);
        if parts[3] == attribute && declared.contains_key(&input) {
            return Some(ParamType::String);
        }
    }
    if parts.len() >= 3 && parts[0] == "fixtures" {
        let fixture = format!("fixtures.{}", parts[1]);
        if declared.get(&fixture) == Some(&ParamType::Fixture) {
            return Some(ParamType::String);
        }
    }
    None
}

/// Every used parameter must be global or declared with the same type
pub fn validate_params(used: &ParamMap, declared: &ParamMap) -> TemplateResult<()> {
    for (name, used_type) in used {
        if has_global_scope(name) {
            continue;
        }
        match resolve_variable(declared, name) {
            None => return Err(TemplateError::unresolved(name.clone(), used_type)),
            Some(declared_type) if declared_type != *used_type => {
                return Err(TemplateError::ParameterResolution {
                    name: name.clone(),
                    type_expected: used_type.to_string(),
                    type_actual: declared_type.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Check the arguments a caller passes to a receiving template.
///
/// Each receiver input is satisfied, in order, by an explicit argument, by a
/// default, or by a same-named parameter in the caller's scope. The names of
/// inputs left unsatisfied are returned.
pub fn validate_receiver_params_partial(
    receiver: &str,
    receiver_inputs: Option<&Inputs>,
    arguments: &Arguments,
    caller_scope: &ParamMap,
) -> TemplateResult<Vec<String>> {
    let declared = receiver_inputs
        .map(|inputs| inputs.declared_params())
        .unwrap_or_default();

    for arg_name in arguments.keys() {
        if declared.is_empty() {
            return Err(TemplateError::invalid(format!(
                "template '{receiver}' does not accept any inputs but arguments were supplied"
            )));
        }
        if !declared.contains_key(&format!("inputs.{arg_name}")) {
            return Err(TemplateError::invalid(format!(
                "template '{receiver}' does not accept an input '{arg_name}'"
            )));
        }
    }

    let mut unresolved = Vec::new();
    for (key, expected) in &declared {
        let arg_name = key.strip_prefix("inputs.").unwrap_or(key);

        if let Some(value) = arguments.get(arg_name) {
            match param_name(value) {
                Some(name) if has_global_scope(name) => {}
                Some(name) => match resolve_variable(caller_scope, name) {
                    None => {
                        return Err(TemplateError::invalid(format!("cannot resolve '{value}'")))
                    }
                    Some(actual) if actual != *expected => {
                        return Err(TemplateError::invalid(format!(
                            "{receiver}.{arg_name} expected parameter of type '{expected}' but received '{actual}' instead"
                        )))
                    }
                    Some(_) => {}
                },
                None => {
                    let literal_ok = match expected {
                        ParamType::String => true,
                        ParamType::Artifact => value.contains("://"),
                        _ => false,
                    };
                    if !literal_ok {
                        return Err(TemplateError::invalid(format!(
                            "{receiver}.{arg_name} expected parameter of type '{expected}' but received a literal value"
                        )));
                    }
                }
            }
            continue;
        }

        if *expected == ParamType::String {
            if let Some(default) = receiver_inputs.and_then(|inputs| inputs.default_for(arg_name)) {
                if !SESSION_DEFAULTS.contains(&default) {
                    continue;
                }
            }
        }

        match caller_scope.get(key) {
            Some(actual) if actual == expected => continue,
            Some(actual) => {
                return Err(TemplateError::invalid(format!(
                    "{receiver}.{arg_name} expected parameter of type '{expected}' but received '{actual}' instead"
                )))
            }
            None => unresolved.push(arg_name.to_string()),
        }
    }
    Ok(unresolved)
}

/// Like [`validate_receiver_params_partial`] but every input must be satisfied
pub fn validate_receiver_params(
    receiver: &str,
    receiver_inputs: Option<&Inputs>,
    arguments: &Arguments,
    caller_scope: &ParamMap,
) -> TemplateResult<()> {
    let unresolved =
        validate_receiver_params_partial(receiver, receiver_inputs, arguments, caller_scope)?;
    match unresolved.first() {
        Some(first) => Err(TemplateError::invalid(format!(
            "{receiver}.{first} parameter was not satisfied by caller"
        ))),
        None => Ok(()),
    }
}
