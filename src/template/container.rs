use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::errors::{TemplateError, TemplateResult};
use super::params::{
    extract_from_str, extract_used_params, is_param, merge_params, validate_params, ParamMap,
    ParamType,
};
use super::types::{de, validate_reference_name, BaseTemplate, Inputs, Outputs};

const PULL_POLICIES: [&str; 3] = ["IfNotPresent", "Always", "Never"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Resource request. Kept as strings so they can be parameterized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub mem_mib: Option<String>,
    #[serde(default, deserialize_with = "de::opt_scalar", skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<String>,
}

impl ContainerResources {
    pub fn is_empty(&self) -> bool {
        self.mem_mib.is_none() && self.cpu_cores.is_none()
    }

    pub fn mem_mib_value(&self) -> f64 {
        self.mem_mib
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    pub fn cpu_cores_value(&self) -> f64 {
        self.cpu_cores
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    fn validate(&self) -> TemplateResult<()> {
        for (field, value) in [("mem_mib", &self.mem_mib), ("cpu_cores", &self.cpu_cores)] {
            if let Some(value) = value {
                let numeric = value.parse::<f64>().map(|v| v >= 0.0).unwrap_or(false);
                if !numeric && !is_param(value) {
                    return Err(TemplateError::invalid(format!(
                        "resources.{field} must be a non-negative number, got '{value}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A single container execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "ContainerResources::is_empty")]
    pub resources: ContainerResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ContainerTemplate {
    /// True when any container field is set, which is how inlined bodies are detected
    pub fn has_body(&self) -> bool {
        !self.image.is_empty()
            || !self.command.is_empty()
            || !self.args.is_empty()
            || !self.env.is_empty()
            || !self.inputs.is_empty()
            || !self.outputs.is_empty()
            || !self.resources.is_empty()
            || self.liveness_probe.is_some()
            || self.readiness_probe.is_some()
            || self.image_pull_policy.is_some()
            || !self.annotations.is_empty()
    }

    /// Structural and scope checks.
    ///
    /// Inlined containers are scope-checked by their parent, so only named
    /// containers check used parameters against their own inputs.
    pub fn validate(&self, _preprocess: bool, inlined: bool) -> TemplateResult<()> {
        self.base.validate(!inlined)?;
        if self.image.trim().is_empty() {
            return Err(TemplateError::invalid("'image' field required"));
        }
        if let Some(policy) = &self.image_pull_policy {
            if !PULL_POLICIES.contains(&policy.as_str()) && !is_param(policy) {
                return Err(TemplateError::invalid(format!(
                    "image_pull_policy must be one of {PULL_POLICIES:?}, got '{policy}'"
                )));
            }
        }
        self.resources.validate()?;
        self.inputs.validate()?;

        for (name, artifact) in &self.inputs.artifacts {
            if artifact.path.as_deref().unwrap_or_default().is_empty() {
                return Err(TemplateError::invalid(format!(
                    "inputs.artifacts.{name}: 'path' field required"
                )));
            }
            if artifact.from.is_some() && !inlined {
                return Err(TemplateError::invalid(format!(
                    "inputs.artifacts.{name}: 'from' is only valid for inlined containers"
                )));
            }
        }
        for (name, volume) in &self.inputs.volumes {
            if volume.mount_path.as_deref().unwrap_or_default().is_empty() {
                return Err(TemplateError::invalid(format!(
                    "inputs.volumes.{name}: 'mount_path' field required"
                )));
            }
            if volume.from.is_some() && !inlined {
                return Err(TemplateError::invalid(format!(
                    "inputs.volumes.{name}: 'from' is only valid for inlined containers"
                )));
            }
        }
        for (name, artifact) in &self.outputs.artifacts {
            validate_reference_name("output artifact", name)?;
            if artifact.path.as_deref().unwrap_or_default().is_empty() {
                return Err(TemplateError::invalid(format!(
                    "outputs.artifacts.{name}: 'path' field required"
                )));
            }
            if artifact.from.is_some() {
                return Err(TemplateError::invalid(format!(
                    "outputs.artifacts.{name}: containers cannot export from other artifacts"
                )));
            }
        }
        for (index, var) in self.env.iter().enumerate() {
            if var.name.trim().is_empty() {
                return Err(TemplateError::invalid(format!("env[{index}]: 'name' field required")));
            }
        }

        if !inlined {
            let used = self.used_parameters(false)?;
            validate_params(&used, &self.inputs.declared_params())?;
        }
        Ok(())
    }

    /// Parameters referenced by the container body.
    ///
    /// With `inlined` set, the `from` sources of the inputs are included since
    /// they live in the parent's scope.
    pub fn used_parameters(&self, inlined: bool) -> TemplateResult<ParamMap> {
        let mut used = ParamMap::new();
        extract_from_str(&self.image, ParamType::String, &mut used)?;
        extract_used_params(&self.command, ParamType::String, &mut used)?;
        extract_used_params(&self.args, ParamType::String, &mut used)?;
        extract_used_params(&self.env, ParamType::String, &mut used)?;
        extract_used_params(&self.resources, ParamType::String, &mut used)?;
        extract_used_params(&self.annotations, ParamType::String, &mut used)?;
        if let Some(probe) = &self.liveness_probe {
            extract_used_params(probe, ParamType::String, &mut used)?;
        }
        if let Some(probe) = &self.readiness_probe {
            extract_used_params(probe, ParamType::String, &mut used)?;
        }
        if let Some(policy) = &self.image_pull_policy {
            extract_from_str(policy, ParamType::String, &mut used)?;
        }
        merge_params(&mut used, &self.outputs.used_parameters()?)?;
        if inlined {
            merge_params(&mut used, &self.inputs.used_parameters()?)?;
        }
        Ok(used)
    }

    /// Requested resources as (cpu cores, memory MiB)
    pub fn requested_resources(&self) -> (f64, f64) {
        (
            self.resources.cpu_cores_value(),
            self.resources.mem_mib_value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container(value: Value) -> ContainerTemplate {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_container() {
        let c = container(json!({
            "type": "container",
            "version": 1,
            "name": "build",
            "image": "golang:1.22",
            "command": ["sh", "-c", "go build -o %%inputs.artifacts.src.path%%/bin %%inputs.parameters.PKG%%"],
            "inputs": {
                "parameters": {"PKG": {"default": "./..."}},
                "artifacts": {"src": {"path": "/src"}}
            },
            "outputs": {"artifacts": {"bin": {"path": "/src/bin"}}},
            "resources": {"mem_mib": 512, "cpu_cores": "0.5"}
        }));
        c.validate(false, false).unwrap();
        assert_eq!(c.requested_resources(), (0.5, 512.0));
    }

    #[test]
    fn test_undeclared_parameter() {
        let c = container(json!({
            "type": "container",
            "version": 1,
            "name": "echo",
            "image": "alpine",
            "command": ["echo", "%%inputs.parameters.MSG%%"]
        }));
        assert_eq!(
            c.validate(false, false).unwrap_err().to_string(),
            "cannot resolve '%%inputs.parameters.MSG%%'"
        );
    }

    #[test]
    fn test_image_required_and_pull_policy() {
        let mut c = container(json!({"type": "container", "version": 1, "name": "x"}));
        assert_eq!(
            c.validate(false, false).unwrap_err().to_string(),
            "'image' field required"
        );
        c.image = "alpine".into();
        c.image_pull_policy = Some("Sometimes".into());
        assert!(c.validate(false, false).is_err());
        c.image_pull_policy = Some("Always".into());
        assert!(c.validate(false, false).is_ok());
    }

    #[test]
    fn test_inlined_from_only() {
        let c = container(json!({
            "image": "alpine",
            "inputs": {"artifacts": {"bin": {"from": "%%steps.build.outputs.artifacts.bin%%", "path": "/bin"}}}
        }));
        assert!(c.validate(false, true).is_ok());
        let used = c.used_parameters(true).unwrap();
        assert_eq!(
            used["steps.build.outputs.artifacts.bin"],
            ParamType::Artifact
        );
    }
}
