//! # Build Context
//!
//! Holds every template parsed from one repository branch, validates them in
//! dependency order and memoizes the outcome per template.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flowmill_core::template::BuildContext;
//!
//! # fn example() -> Result<(), flowmill_core::template::TemplateError> {
//! let mut ctx = BuildContext::new("github.com/acme/shop", "main").with_strict(true);
//! ctx.parse_directory(".flowmill")?;
//! ctx.validate()?;
//! let embedded = ctx.embed("ci")?;
//! # let _ = embedded;
//! # Ok(())
//! # }
//! ```

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::document::{unknown_fields, Template};
use super::embed::{embed_template, EmbeddedTemplate};
use super::errors::{TemplateError, TemplateResult};
use super::types::TemplateType;
use crate::constants::MAX_TEMPLATE_DEPTH;

static DOCUMENT_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^---[ \t]*$").expect("Valid regex pattern"));

#[derive(Debug, Default)]
pub struct BuildContext {
    pub repo: String,
    pub branch: String,
    pub strict: bool,
    pub ignore_errors: bool,
    templates: BTreeMap<String, Arc<Template>>,
    path_to_templates: BTreeMap<PathBuf, Vec<String>>,
    template_to_path: BTreeMap<String, PathBuf>,
    results: BTreeMap<String, TemplateResult<()>>,
    in_progress: HashSet<String>,
    first_error: Option<TemplateError>,
}

impl BuildContext {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            ..Self::default()
        }
    }

    /// Reject documents with fields the template kinds do not define
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Record failures and keep going instead of returning the first one
    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    /// Parse a multi-document YAML string. Returns the names added.
    pub fn parse_str(&mut self, source: &str, contents: &str) -> TemplateResult<Vec<String>> {
        let mut added = Vec::new();
        for document in DOCUMENT_SEPARATOR.split(contents) {
            match self.parse_document(source, document) {
                Ok(Some(name)) => added.push(name),
                Ok(None) => {}
                Err(e) => self.record_error(e)?,
            }
        }
        Ok(added)
    }

    fn parse_document(&mut self, source: &str, document: &str) -> TemplateResult<Option<String>> {
        let value: Value = serde_yaml::from_str(document)
            .map_err(|e| TemplateError::parse(source, e.to_string()))?;
        if value.is_null() {
            return Ok(None);
        }
        let template = Template::from_value(value.clone())
            .map_err(|e| TemplateError::parse(source, e.to_string()))?;

        if self.strict {
            let typed = serde_json::to_value(&template)?;
            let unknown = unknown_fields(&value, &typed, "");
            if !unknown.is_empty() {
                return Err(TemplateError::parse(
                    source,
                    format!(
                        "template '{}' has unknown fields: {}",
                        template.name(),
                        unknown.join(", ")
                    ),
                ));
            }
        }

        let name = template.name().to_string();
        self.insert(template)?;
        self.path_to_templates
            .entry(PathBuf::from(source))
            .or_default()
            .push(name.clone());
        self.template_to_path
            .insert(name.clone(), PathBuf::from(source));
        Ok(Some(name))
    }

    pub fn parse_file(&mut self, path: impl AsRef<Path>) -> TemplateResult<Vec<String>> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::parse(&source, e.to_string()))?;
        self.parse_str(&source, &contents)
    }

    /// Parse every `.yaml`/`.yml` file below `dir`, in path order
    pub fn parse_directory(&mut self, dir: impl AsRef<Path>) -> TemplateResult<Vec<String>> {
        let dir = dir.as_ref();
        let mut added = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry =
                entry.map_err(|e| TemplateError::parse(dir.display().to_string(), e.to_string()))?;
            let is_yaml = entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if entry.file_type().is_file() && is_yaml {
                added.extend(self.parse_file(entry.path())?);
            }
        }
        debug!(
            directory = %dir.display(),
            templates = added.len(),
            "📄 Parsed template directory"
        );
        Ok(added)
    }

    pub fn insert(&mut self, template: Template) -> TemplateResult<()> {
        let name = template.name().to_string();
        if self.templates.contains_key(&name) {
            return Err(TemplateError::Duplicate { name });
        }
        self.templates.insert(name, Arc::new(template));
        Ok(())
    }

    fn record_error(&mut self, error: TemplateError) -> TemplateResult<()> {
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
        if self.ignore_errors {
            warn!(error = %error, "⚠️ Ignoring template error");
            Ok(())
        } else {
            Err(error)
        }
    }

    /// Validate every template: container, deployment, workflow, fixture,
    /// policy, then project.
    pub fn validate(&mut self) -> TemplateResult<()> {
        for kind in TemplateType::VALIDATION_ORDER {
            let names: Vec<String> = self
                .templates
                .iter()
                .filter(|(_, t)| t.template_type() == kind)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                if let Err(e) = self.validate_template(&name, 0) {
                    self.record_error(e.at(&name))?;
                }
            }
        }
        Ok(())
    }

    /// Validate one template and, transitively, everything it references
    pub fn validate_template(&mut self, name: &str, depth: usize) -> TemplateResult<()> {
        if let Some(result) = self.results.get(name) {
            return result.clone();
        }
        if depth > MAX_TEMPLATE_DEPTH || self.in_progress.contains(name) {
            return Err(TemplateError::Recursive);
        }
        let template = self.lookup(name).ok_or_else(|| TemplateError::NotFound {
            name: name.to_string(),
        })?;

        self.in_progress.insert(name.to_string());
        let result = template
            .validate(false)
            .and_then(|()| template.validate_context(self, depth));
        self.in_progress.remove(name);

        self.mark_processed(name, result.clone());
        result
    }

    /// Look up a referenced template and make sure it is valid
    pub(crate) fn child(&mut self, name: &str, depth: usize) -> TemplateResult<Arc<Template>> {
        let template = self
            .lookup(name)
            .ok_or_else(|| TemplateError::invalid(format!("template '{name}' not found")))?;
        match self.validate_template(name, depth) {
            Ok(()) => Ok(template),
            Err(TemplateError::Recursive) => Err(TemplateError::Recursive),
            Err(_) => Err(TemplateError::invalid(format!(
                "child template '{name}' is not valid"
            ))),
        }
    }

    /// A successful result never overwrites a recorded failure
    fn mark_processed(&mut self, name: &str, result: TemplateResult<()>) {
        match self.results.get(name) {
            Some(Err(_)) if result.is_ok() => {}
            _ => {
                self.results.insert(name.to_string(), result);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    pub fn result(&self, name: &str) -> Option<&TemplateResult<()>> {
        self.results.get(name)
    }

    pub fn first_error(&self) -> Option<&TemplateError> {
        self.first_error.as_ref()
    }

    pub fn templates(&self) -> impl Iterator<Item = &Arc<Template>> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn template_path(&self, name: &str) -> Option<&Path> {
        self.template_to_path.get(name).map(PathBuf::as_path)
    }

    pub fn templates_in(&self, path: impl AsRef<Path>) -> &[String] {
        self.path_to_templates
            .get(path.as_ref())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Stable identity derived from (repo, branch, name)
    pub fn template_id(&self, name: &str) -> Uuid {
        template_id(&self.repo, &self.branch, name)
    }

    /// Produce the self-contained form of a validated template
    pub fn embed(&mut self, name: &str) -> TemplateResult<EmbeddedTemplate> {
        self.validate_template(name, 0)?;
        embed_template(self, name)
    }
}

pub fn template_id(repo: &str, branch: &str, name: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{repo}:{branch}:{name}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::types::{BaseTemplate, InputParameter};
    use crate::template::ContainerTemplate;
    use proptest::prelude::*;

    const TEMPLATES: &str = r#"
type: container
version: 1
name: build
image: golang:1.22
inputs:
  parameters:
    COMMIT:
command: ["make", "%%inputs.parameters.COMMIT%%"]
outputs:
  artifacts:
    bin:
      path: /out/bin
---
type: workflow
version: 1
name: ci
inputs:
  parameters:
    COMMIT:
steps:
  - build:
      template: build
      arguments:
        parameters.COMMIT: "%%inputs.parameters.COMMIT%%"
  - test:
      image: alpine
      command: ["./test"]
      inputs:
        artifacts:
          bin:
            from: "%%steps.build.outputs.artifacts.bin%%"
            path: /bin
outputs:
  artifacts:
    bin:
      from: "%%steps.build.outputs.artifacts.bin%%"
"#;

    #[test]
    fn test_parse_and_validate() {
        let mut ctx = BuildContext::new("repo", "main").with_strict(true);
        let added = ctx.parse_str("ci.yaml", TEMPLATES).unwrap();
        assert_eq!(added, vec!["build".to_string(), "ci".to_string()]);
        ctx.validate().unwrap();
        assert_eq!(ctx.result("ci"), Some(&Ok(())));
        assert_eq!(ctx.templates_in("ci.yaml").len(), 2);
    }

    #[test]
    fn test_duplicate_names() {
        let mut ctx = BuildContext::new("repo", "main");
        ctx.parse_str("a.yaml", TEMPLATES).unwrap();
        let err = ctx.parse_str("b.yaml", TEMPLATES).unwrap_err();
        assert_eq!(err, TemplateError::Duplicate { name: "build".into() });
    }

    #[test]
    fn test_strict_rejects_unknown_fields() {
        let doc = "type: container\nversion: 1\nname: x\nimage: alpine\nimagePullSecrets: [a]\n";
        let mut lenient = BuildContext::new("repo", "main");
        assert!(lenient.parse_str("x.yaml", doc).is_ok());

        let mut strict = BuildContext::new("repo", "main").with_strict(true);
        let err = strict.parse_str("x.yaml", doc).unwrap_err();
        assert!(err.to_string().contains("unknown fields: imagePullSecrets"));
    }

    #[test]
    fn test_recursive_workflows() {
        let docs = r#"
type: workflow
version: 1
name: a
steps:
  - call-b:
      template: b
---
type: workflow
version: 1
name: b
steps:
  - call-a:
      template: a
"#;
        let mut ctx = BuildContext::new("repo", "main").with_ignore_errors(true);
        ctx.parse_str("loop.yaml", docs).unwrap();
        ctx.validate().unwrap();
        assert_eq!(ctx.result("a"), Some(&Err(TemplateError::Recursive)));
        assert_eq!(ctx.result("b"), Some(&Err(TemplateError::Recursive)));
        assert!(ctx.first_error().is_some());
    }

    #[test]
    fn test_invalid_child_is_reported() {
        let docs = r#"
type: container
version: 1
name: broken
command: ["true"]
---
type: workflow
version: 1
name: wf
steps:
  - run:
      template: broken
"#;
        let mut ctx = BuildContext::new("repo", "main").with_ignore_errors(true);
        ctx.parse_str("x.yaml", docs).unwrap();
        ctx.validate().unwrap();
        assert_eq!(
            ctx.result("wf").unwrap().clone().unwrap_err().to_string(),
            "steps[0].run: child template 'broken' is not valid"
        );
    }

    #[test]
    fn test_template_id_is_stable() {
        let ctx = BuildContext::new("repo", "main");
        assert_eq!(ctx.template_id("ci"), template_id("repo", "main", "ci"));
        assert_ne!(ctx.template_id("ci"), template_id("repo", "dev", "ci"));
    }

    #[test]
    fn test_separator_inside_strings_is_not_a_boundary() {
        let doc = "type: container\nversion: 1\nname: notes\nimage: alpine\ndescription: |\n  before\n  ---\n  after\ncommand: [\"echo\", \"---\"]\n";
        let mut ctx = BuildContext::new("repo", "main");
        assert_eq!(ctx.parse_str("notes.yaml", doc).unwrap(), vec!["notes".to_string()]);
        let notes = ctx.lookup("notes").unwrap();
        assert_eq!(notes.base().description.as_deref(), Some("before\n---\nafter\n"));
    }

    fn container_strategy() -> impl Strategy<Value = ContainerTemplate> {
        (
            "t-[a-z0-9-]{1,10}",
            "registry/[a-z]{1,8}(:[0-9]{1,2})?",
            "about [a-z]{1,6}( ?---? ?[a-z]{1,6}){0,3}",
            prop::collection::vec("run[a-z0-9 ./-]{0,10}", 0..4),
            prop::collection::btree_map("[A-Z][A-Z0-9_]{0,6}", prop::option::of("v[a-z0-9]{0,5}"), 0..4),
        )
            .prop_map(|(name, image, description, command, parameters)| {
                let mut base = BaseTemplate::new(TemplateType::Container, name);
                base.description = Some(description);
                let mut container = ContainerTemplate {
                    base,
                    image,
                    command,
                    ..ContainerTemplate::default()
                };
                for (param, default) in parameters {
                    container.inputs.parameters.insert(
                        param,
                        InputParameter {
                            default,
                            description: None,
                        },
                    );
                }
                container
            })
    }

    proptest! {
        #[test]
        fn quoted_separator_yields_one_template(
            before in "[a-z ]{0,8}",
            after in "[a-z ]{0,8}",
        ) {
            let doc = format!(
                "type: container\nversion: 1\nname: quoted\nimage: alpine\ndescription: \"{before}---{after}\"\n"
            );
            let mut ctx = BuildContext::new("repo", "main");
            prop_assert_eq!(ctx.parse_str("quoted.yaml", &doc).unwrap(), vec!["quoted".to_string()]);
            prop_assert_eq!(ctx.len(), 1);
            let expected = format!("{before}---{after}");
            let looked_up = ctx.lookup("quoted").unwrap();
            prop_assert_eq!(looked_up.base().description.as_deref(), Some(expected.as_str()));
        }

        #[test]
        fn serialized_templates_parse_back_valid(container in container_strategy()) {
            let template = Template::Container(container);
            let yaml = serde_yaml::to_string(&template).unwrap();

            let mut ctx = BuildContext::new("repo", "main").with_strict(true);
            let added = ctx.parse_str("generated.yaml", &yaml).unwrap();
            prop_assert_eq!(added, vec![template.name().to_string()]);
            ctx.validate().unwrap();
            let looked_up = ctx.lookup(template.name()).unwrap();
            prop_assert_eq!(looked_up.as_ref(), &template);
        }
    }
}
