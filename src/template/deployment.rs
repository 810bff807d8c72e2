use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use super::context::BuildContext;
use super::errors::{TemplateError, TemplateResult};
use super::inline::InlineContainerTemplateRef;
use super::params::{
    extract_used_params, is_param, validate_params, validate_receiver_params, ParamMap, ParamType,
};
use super::types::{
    de, validate_reference_name, BaseTemplate, FixtureRequirement, Inputs, TerminationPolicy,
    VolumeRequirement,
};
use super::TemplateType;
use crate::constants::{MAX_DNS_LABEL_LENGTH, MAX_EXTERNAL_DNS_NAME_LENGTH};

static DNS_LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?)$").expect("Valid regex pattern"));

pub fn is_dns_label(value: &str) -> bool {
    value.len() <= MAX_DNS_LABEL_LENGTH && DNS_LABEL_REGEX.is_match(value)
}

fn default_min_scale() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scale {
    #[serde(default = "default_min_scale")]
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl Default for Scale {
    fn default() -> Self {
        Self { min: 1, max: None }
    }
}

/// Upgrade strategies. Closed: anything else is a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Recreate,
    RollingUpdate,
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recreate => write!(f, "recreate"),
            Self::RollingUpdate => write!(f, "rolling_update"),
        }
    }
}

impl FromStr for StrategyType {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recreate" => Ok(Self::Recreate),
            "rolling_update" => Ok(Self::RollingUpdate),
            _ => Err(TemplateError::invalid(
                "strategy.type can only be one of [recreate, rolling_update]",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub max_surge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "de::opt_scalar")]
    pub max_unavailable: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub strategy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    World,
    Organization,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_domain: Option<String>,
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_white_list: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
}

impl ExternalRoute {
    pub fn dns_name(&self) -> String {
        match (&self.dns_prefix, &self.dns_domain) {
            (Some(prefix), Some(domain)) => format!("{prefix}.{domain}"),
            (Some(prefix), None) => prefix.clone(),
            (None, Some(domain)) => domain.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalRoute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<RoutePort>,
}

/// A long-running set of identical container instances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub application_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_name: String,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_routes: Vec<ExternalRoute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_routes: Vec<InternalRoute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, InlineContainerTemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<BTreeMap<String, FixtureRequirement>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_policy: Option<TerminationPolicy>,
}

impl Strategy {
    /// Declared strategy, or the default for a deployment with or without volumes
    pub fn resolve(strategy: Option<&Strategy>, has_volumes: bool) -> TemplateResult<StrategyType> {
        match strategy.map(|s| s.strategy_type.as_str()) {
            Some(declared) if !declared.is_empty() => declared.parse(),
            _ if has_volumes => Ok(StrategyType::Recreate),
            _ => Ok(StrategyType::RollingUpdate),
        }
    }

    /// (max_surge, max_unavailable), both defaulting to 1
    pub fn limits(strategy: Option<&Strategy>) -> (u32, u32) {
        let rolling = strategy.and_then(|s| s.rolling_update.as_ref());
        let read = |value: Option<&String>| {
            value.and_then(|v| v.parse::<u32>().ok()).unwrap_or(1)
        };
        (
            read(rolling.and_then(|r| r.max_surge.as_ref())),
            read(rolling.and_then(|r| r.max_unavailable.as_ref())),
        )
    }
}

impl DeploymentTemplate {
    pub fn strategy_type(&self) -> TemplateResult<StrategyType> {
        Strategy::resolve(self.strategy.as_ref(), !self.volumes.is_empty())
    }

    pub fn rolling_update_limits(&self) -> (u32, u32) {
        Strategy::limits(self.strategy.as_ref())
    }

    pub fn validate(&self, preprocess: bool) -> TemplateResult<()> {
        self.base.validate(true)?;
        self.inputs.validate()?;
        if let Some(policy) = &self.termination_policy {
            policy.validate()?;
        }

        for (field, value) in [
            ("application_name", &self.application_name),
            ("deployment_name", &self.deployment_name),
        ] {
            if value.is_empty() {
                return Err(TemplateError::invalid(format!("'{field}' field required")));
            }
            if !is_param(value) && !is_dns_label(value) {
                return Err(TemplateError::invalid(format!(
                    "{field} '{value}' must be a valid DNS-1123 label of at most {MAX_DNS_LABEL_LENGTH} characters"
                )));
            }
        }

        if let Some(max) = self.scale.max {
            if self.scale.min > max {
                return Err(TemplateError::invalid("scale.min cannot exceed scale.max"));
            }
        }
        if !self.volumes.is_empty()
            && (self.scale.min > 1 || self.scale.max.map(|m| m > 1).unwrap_or(false))
        {
            return Err(TemplateError::invalid(format!(
                "{}.scale: deployment requiring volumes cannot scale past 1 instance",
                self.base.name
            )));
        }

        self.validate_strategy()?;

        for group in &self.fixtures {
            for (name, requirement) in group {
                validate_reference_name("fixture", name)?;
                if requirement.is_dynamic() {
                    return Err(TemplateError::invalid("deployments cannot use dynamic fixtures"));
                }
                requirement.validate().map_err(|e| e.at(format!("fixtures.{name}")))?;
            }
        }
        for (name, volume) in &self.volumes {
            validate_reference_name("volume", name)?;
            volume.validate().map_err(|e| e.at(format!("volumes.{name}")))?;
        }

        self.validate_routes()?;

        if self.containers.is_empty() {
            return Err(TemplateError::invalid("'containers' field required"));
        }
        if self.containers.len() > 1 {
            return Err(TemplateError::invalid(
                "Only one container per deployment is currently supported",
            ));
        }
        for (name, slot) in &self.containers {
            validate_reference_name("container", name)?;
            let path = format!("containers.{name}");
            slot.validate(preprocess).map_err(|e| e.at(&path))?;
            if slot.is_inlined() && !preprocess {
                slot.reverse_inline(&format!("{}-{name}", self.base.name))
                    .map_err(|e| e.at(&path))?;
            }
        }
        Ok(())
    }

    fn validate_strategy(&self) -> TemplateResult<()> {
        let strategy_type = self.strategy_type().map_err(|e| e.at("strategy"))?;
        let rolling = self.strategy.as_ref().and_then(|s| s.rolling_update.as_ref());
        match strategy_type {
            StrategyType::Recreate if rolling.is_some() => Err(TemplateError::invalid(
                "recreate strategy cannot specify rolling_update",
            )
            .at("strategy")),
            StrategyType::RollingUpdate if !self.volumes.is_empty() => Err(TemplateError::invalid(
                "rolling_update strategy cannot be used by deployments requiring volumes",
            )
            .at("strategy")),
            StrategyType::RollingUpdate => {
                if let Some(rolling) = rolling {
                    for (field, value) in [
                        ("max_surge", &rolling.max_surge),
                        ("max_unavailable", &rolling.max_unavailable),
                    ] {
                        if let Some(value) = value {
                            if value.parse::<u32>().is_err() && !is_param(value) {
                                return Err(TemplateError::invalid(format!(
                                    "{field} must be an integer, got '{value}'"
                                ))
                                .at("strategy.rolling_update"));
                            }
                        }
                    }
                }
                if self.rolling_update_limits() == (0, 0) {
                    return Err(TemplateError::invalid(
                        "max_surge and max_unavailable cannot both be 0",
                    )
                    .at("strategy.rolling_update"));
                }
                Ok(())
            }
            StrategyType::Recreate => Ok(()),
        }
    }

    fn validate_routes(&self) -> TemplateResult<()> {
        let mut names = HashSet::new();
        for (index, route) in self.internal_routes.iter().enumerate() {
            let path = format!("internal_routes[{index}]");
            if !is_param(&route.name) && !is_dns_label(&route.name) {
                return Err(TemplateError::invalid(format!(
                    "name '{}' must be a valid DNS-1123 label",
                    route.name
                ))
                .at(&path));
            }
            if !names.insert(route.name.as_str()) {
                return Err(
                    TemplateError::invalid(format!("duplicate route name '{}'", route.name))
                        .at(&path),
                );
            }
            if route.ports.is_empty() {
                return Err(TemplateError::invalid("at least one port required").at(&path));
            }
        }

        let mut target_ports = HashSet::new();
        for (index, route) in self.external_routes.iter().enumerate() {
            let path = format!("external_routes[{index}]");
            let port = route
                .target_port
                .as_deref()
                .ok_or_else(|| TemplateError::invalid("'target_port' field required").at(&path))?;
            if !is_param(port) && port.parse::<u16>().is_err() {
                return Err(TemplateError::invalid(format!(
                    "target_port must be an integer, got '{port}'"
                ))
                .at(&path));
            }
            if !target_ports.insert(port) {
                return Err(
                    TemplateError::invalid(format!("duplicate target_port {port}")).at(&path),
                );
            }
            if route.ip_white_list.is_empty() {
                return Err(TemplateError::invalid("ip_white_list cannot be empty").at(&path));
            }
            for cidr in &route.ip_white_list {
                if !is_param(cidr) && !is_ipv4_cidr(cidr) {
                    return Err(
                        TemplateError::invalid(format!("invalid CIDR '{cidr}'")).at(&path)
                    );
                }
            }
            if route.dns_name().len() > MAX_EXTERNAL_DNS_NAME_LENGTH {
                return Err(TemplateError::invalid(format!(
                    "dns name cannot exceed {MAX_EXTERNAL_DNS_NAME_LENGTH} characters"
                ))
                .at(&path));
            }
        }
        Ok(())
    }

    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        let mut scope = self.inputs.declared_params();
        for name in self.volumes.keys() {
            scope.insert(format!("volumes.{name}"), ParamType::Volume);
        }
        for group in &self.fixtures {
            for (name, requirement) in group {
                validate_params(&requirement.used_parameters()?, &scope)
                    .map_err(|e| e.at(format!("fixtures.{name}")))?;
                scope.insert(format!("fixtures.{name}"), ParamType::Fixture);
            }
        }

        for (name, slot) in &self.containers {
            let path = format!("containers.{name}");
            if slot.is_inlined() {
                validate_params(&slot.used_parameters()?, &scope).map_err(|e| e.at(&path))?;
                continue;
            }
            let child = ctx
                .child(&slot.template_ref.template, depth + 1)
                .map_err(|e| e.at(&path))?;
            if child.template_type() != TemplateType::Container {
                return Err(TemplateError::invalid(format!(
                    "template '{}' must be of type: container",
                    child.name()
                ))
                .at(&path));
            }
            validate_receiver_params(
                child.name(),
                child.inputs(),
                &slot.template_ref.arguments,
                &scope,
            )
            .map_err(|e| e.at(&path))?;
        }

        let mut own = ParamMap::new();
        extract_used_params(&self.external_routes, ParamType::String, &mut own)?;
        extract_used_params(&self.internal_routes, ParamType::String, &mut own)?;
        extract_used_params(&self.volumes, ParamType::String, &mut own)?;
        extract_from_names(self, &mut own)?;
        validate_params(&own, &scope)
    }
}

fn extract_from_names(deployment: &DeploymentTemplate, into: &mut ParamMap) -> TemplateResult<()> {
    extract_used_params(&deployment.application_name, ParamType::String, into)?;
    extract_used_params(&deployment.deployment_name, ParamType::String, into)
}

fn is_ipv4_cidr(value: &str) -> bool {
    let Some((address, prefix)) = value.split_once('/') else {
        return false;
    };
    address.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn deployment(overrides: Value) -> DeploymentTemplate {
        let mut base = json!({
            "type": "deployment", "version": 1, "name": "web",
            "application_name": "shop", "deployment_name": "frontend",
            "containers": {"server": {"image": "nginx", "resources": {"cpu_cores": 1, "mem_mib": 100}}}
        });
        crate::objects::apply_merge_patch(&mut base, &overrides);
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn test_valid_deployment_defaults() {
        let d = deployment(json!({}));
        d.validate(false).unwrap();
        assert_eq!(d.strategy_type().unwrap(), StrategyType::RollingUpdate);
        assert_eq!(d.rolling_update_limits(), (1, 1));
    }

    #[test]
    fn test_volumes_limit_scale() {
        let d = deployment(json!({
            "scale": {"min": 2},
            "volumes": {"data": {"name": "shared"}}
        }));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "web.scale: deployment requiring volumes cannot scale past 1 instance"
        );
    }

    #[test]
    fn test_strategy_checks() {
        let d = deployment(json!({"strategy": {"type": "blue_green"}}));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "strategy: strategy.type can only be one of [recreate, rolling_update]"
        );

        let d = deployment(json!({
            "strategy": {"type": "rolling_update", "rolling_update": {"max_surge": 0, "max_unavailable": 0}}
        }));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "strategy.rolling_update: max_surge and max_unavailable cannot both be 0"
        );

        let d = deployment(json!({
            "strategy": {"type": "rolling_update"},
            "volumes": {"data": {"name": "shared"}}
        }));
        assert!(d.validate(false).is_err());
    }

    #[test]
    fn test_dynamic_fixtures_rejected() {
        let d = deployment(json!({"fixtures": [{"db": {"template": "postgres"}}]}));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "deployments cannot use dynamic fixtures"
        );
    }

    #[test]
    fn test_routes() {
        let d = deployment(json!({
            "external_routes": [{"dns_prefix": "shop", "target_port": 8080, "ip_white_list": ["10.0.0.0/8"]}],
            "internal_routes": [{"name": "api", "ports": [{"port": 80, "target_port": 8080}]}]
        }));
        d.validate(false).unwrap();
        assert_eq!(d.external_routes[0].visibility, Visibility::World);

        let d = deployment(json!({
            "external_routes": [{"target_port": 8080, "ip_white_list": ["10.0.0.0/40"]}]
        }));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "external_routes[0]: invalid CIDR '10.0.0.0/40'"
        );
    }

    #[test]
    fn test_single_container() {
        let d = deployment(json!({"containers": {"sidecar": {"image": "envoy"}}}));
        assert_eq!(
            d.validate(false).unwrap_err().to_string(),
            "Only one container per deployment is currently supported"
        );
    }
}
