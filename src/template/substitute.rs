//! # Argument Substitution
//!
//! Expands arguments into an embedded template top-down. Each node is
//! serialized with its children detached, fixture attributes and input
//! references are replaced textually, and the node is decoded again. Child
//! arguments are substituted as part of their parent, which is how values
//! propagate down the tree.

use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::embed::{EmbeddedStep, EmbeddedTemplate};
use super::errors::TemplateResult;
use super::params::{is_param, validate_receiver_params, ParamMap};
use super::types::{Arguments, Inputs};

static FIXTURE_ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%%(inputs\.)?fixtures\.([-0-9A-Za-z_]+)\.([-0-9A-Za-z_]+)%%")
        .expect("Valid regex pattern")
});

static INPUT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%%inputs\.(parameters|artifacts|volumes)\.([-0-9A-Za-z_]+)(\.[-0-9A-Za-z_]+)?%%")
        .expect("Valid regex pattern")
});

/// Fixture name to the attributes of the instance assigned to it
pub type FixtureAssignments = BTreeMap<String, BTreeMap<String, Value>>;

/// Substitute `arguments` into `template`, then validate the result in
/// preprocessing mode.
pub fn substitute(
    template: &EmbeddedTemplate,
    arguments: &Arguments,
    fixtures: &FixtureAssignments,
) -> TemplateResult<EmbeddedTemplate> {
    validate_receiver_params(template.name(), Some(template.inputs()), arguments, &ParamMap::new())?;
    let substituted = substitute_node(template, arguments, fixtures)?;
    substituted.validate(true)?;
    Ok(substituted)
}

fn substitute_node(
    template: &EmbeddedTemplate,
    arguments: &Arguments,
    fixtures: &FixtureAssignments,
) -> TemplateResult<EmbeddedTemplate> {
    let mut node = template.clone();
    let children = detach_children(&mut node);

    let serialized = serde_json::to_string(&node)?;
    let serialized = replace_fixture_attributes(&serialized, arguments, fixtures);
    let serialized = replace_inputs(&serialized, node.inputs(), arguments);
    let mut node = EmbeddedTemplate::from_value(serde_json::from_str(&serialized)?)?;

    let mut substituted = Vec::with_capacity(children.len());
    for (slot, child) in children {
        let child_args = child_arguments(slot_arguments(&node, &slot), child.inputs(), arguments);
        substituted.push((slot, substitute_node(&child, &child_args, fixtures)?));
    }
    attach_children(&mut node, substituted);
    Ok(node)
}

/// Where a child lives inside its parent
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Step { group: usize, name: String },
    Fixture { group: usize, name: String },
    Container { name: String },
}

fn detach_children(node: &mut EmbeddedTemplate) -> Vec<(Slot, EmbeddedTemplate)> {
    let mut children = Vec::new();
    match node {
        EmbeddedTemplate::Container(_) => {}
        EmbeddedTemplate::Workflow(workflow) => {
            for (group, steps) in workflow.steps.iter_mut().enumerate() {
                for (name, step) in steps.iter_mut() {
                    if let Some(child) = step.template.take() {
                        children.push((Slot::Step { group, name: name.clone() }, *child));
                    }
                }
            }
            for (group, fixtures) in workflow.fixtures.iter_mut().enumerate() {
                for (name, fixture) in fixtures.iter_mut() {
                    if let Some(child) = fixture.template.take() {
                        children.push((Slot::Fixture { group, name: name.clone() }, *child));
                    }
                }
            }
        }
        EmbeddedTemplate::Deployment(deployment) => {
            for (name, slot) in deployment.containers.iter_mut() {
                if let Some(child) = slot.template.take() {
                    children.push((Slot::Container { name: name.clone() }, *child));
                }
            }
        }
    }
    children
}

fn slot_arguments<'a>(node: &'a EmbeddedTemplate, slot: &Slot) -> Option<&'a Arguments> {
    match (node, slot) {
        (EmbeddedTemplate::Workflow(w), Slot::Step { group, name }) => {
            w.steps.get(*group)?.get(name).map(|s| &s.arguments)
        }
        (EmbeddedTemplate::Workflow(w), Slot::Fixture { group, name }) => {
            w.fixtures.get(*group)?.get(name).map(|f| &f.arguments)
        }
        (EmbeddedTemplate::Deployment(d), Slot::Container { name }) => {
            d.containers.get(name).map(|s: &EmbeddedStep| &s.arguments)
        }
        _ => None,
    }
}

fn attach_children(node: &mut EmbeddedTemplate, children: Vec<(Slot, EmbeddedTemplate)>) {
    for (slot, child) in children {
        let child = Some(Box::new(child));
        match (&mut *node, slot) {
            (EmbeddedTemplate::Workflow(w), Slot::Step { group, name }) => {
                if let Some(step) = w.steps.get_mut(group).and_then(|g| g.get_mut(&name)) {
                    step.template = child;
                }
            }
            (EmbeddedTemplate::Workflow(w), Slot::Fixture { group, name }) => {
                if let Some(fixture) = w.fixtures.get_mut(group).and_then(|g| g.get_mut(&name)) {
                    fixture.template = child;
                }
            }
            (EmbeddedTemplate::Deployment(d), Slot::Container { name }) => {
                if let Some(container) = d.containers.get_mut(&name) {
                    container.template = child;
                }
            }
            _ => {}
        }
    }
}

/// The slot's own arguments, plus parent arguments with the same name for
/// child inputs the slot leaves unset
fn child_arguments(own: Option<&Arguments>, child_inputs: &Inputs, parent: &Arguments) -> Arguments {
    let mut merged = own.cloned().unwrap_or_default();
    for key in child_inputs.declared_params().keys() {
        let arg_name = key.strip_prefix("inputs.").unwrap_or(key);
        if merged.contains_key(arg_name) {
            continue;
        }
        if let Some(value) = parent.get(arg_name) {
            merged.insert(arg_name.to_string(), value.clone());
        }
    }
    merged
}

/// Escape a value for splicing into a JSON string literal
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn attribute_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn replace_fixture_attributes(
    serialized: &str,
    arguments: &Arguments,
    fixtures: &FixtureAssignments,
) -> String {
    FIXTURE_ATTRIBUTE_REGEX
        .replace_all(serialized, |caps: &Captures<'_>| {
            let via_input = caps.get(1).is_some();
            let fixture = &caps[2];
            let attribute = &caps[3];
            let assigned = if via_input {
                arguments
                    .get(&format!("fixtures.{fixture}"))
                    .map(|v| v.trim_matches('%').trim_start_matches("fixtures.").to_string())
                    .unwrap_or_else(|| fixture.to_string())
            } else {
                fixture.to_string()
            };
            fixtures
                .get(&assigned)
                .and_then(|attributes| attributes.get(attribute))
                .map(|value| json_escape(&attribute_text(value)))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn replace_inputs(serialized: &str, inputs: &Inputs, arguments: &Arguments) -> String {
    INPUT_REGEX
        .replace_all(serialized, |caps: &Captures<'_>| {
            let section = &caps[1];
            let name = &caps[2];
            let attribute = caps.get(3).map(|m| &m.as_str()[1..]);
            let replacement = match (section, attribute) {
                ("parameters", None) => arguments
                    .get(&format!("parameters.{name}"))
                    .cloned()
                    .or_else(|| inputs.parameters.get(name).and_then(|p| p.default.clone())),
                ("artifacts", Some("path")) => {
                    inputs.artifacts.get(name).and_then(|a| a.path.clone())
                }
                ("volumes", Some("mount_path")) => {
                    inputs.volumes.get(name).and_then(|v| v.mount_path.clone())
                }
                ("artifacts", None) | ("volumes", None) => arguments
                    .get(&format!("{section}.{name}"))
                    .filter(|value| !is_param(value))
                    .cloned(),
                _ => None,
            };
            replacement
                .map(|value| json_escape(&value))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Parameter references left in a substituted template, excluding globals
pub fn unresolved_parameters(template: &EmbeddedTemplate) -> TemplateResult<Vec<String>> {
    let serialized = serde_json::to_string(template)?;
    let mut remaining: Vec<String> = super::params::VAR_REGEX
        .find_iter(&serialized)
        .map(|m| m.as_str().trim_matches('%').to_string())
        .filter(|name| name.starts_with("inputs.parameters."))
        .collect();
    remaining.sort();
    remaining.dedup();
    Ok(remaining)
}
