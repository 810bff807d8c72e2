//! Policy templates (when to run a workflow automatically) and project
//! templates (how a repository presents its workflows).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::context::BuildContext;
use super::errors::{TemplateError, TemplateResult};
use super::params::{validate_receiver_params_partial, ParamMap};
use super::types::{validate_reference_name, BaseTemplate, TemplateRef};
use super::TemplateType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEvent {
    OnPush,
    OnPullRequest,
    OnPullRequestMerge,
    OnCron,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTrigger {
    pub event: PolicyEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    OnStart,
    OnSuccess,
    OnFailure,
    OnChange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub when: Vec<NotificationEvent>,
    #[serde(default)]
    pub whom: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(flatten)]
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<PolicyTrigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl PolicyTemplate {
    pub fn validate(&self) -> TemplateResult<()> {
        self.base.validate(true)?;
        self.template_ref.validate()?;
        for (index, trigger) in self.when.iter().enumerate() {
            if trigger.event == PolicyEvent::OnCron {
                let fields = trigger
                    .schedule
                    .as_deref()
                    .map(|s| s.split_whitespace().count())
                    .unwrap_or(0);
                if fields != 5 {
                    return Err(TemplateError::invalid(
                        "on_cron trigger requires a 5-field 'schedule'",
                    )
                    .at(format!("when[{index}]")));
                }
            } else if trigger.schedule.is_some() {
                return Err(TemplateError::invalid(
                    "'schedule' is only valid for on_cron triggers",
                )
                .at(format!("when[{index}]")));
            }
        }
        for (index, notification) in self.notifications.iter().enumerate() {
            let path = format!("notifications[{index}]");
            if notification.whom.is_empty() {
                return Err(TemplateError::invalid("'whom' field required").at(&path));
            }
            if notification.when.is_empty() {
                return Err(TemplateError::invalid("'when' field required").at(&path));
            }
        }
        Ok(())
    }

    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        validate_workflow_target(ctx, &self.template_ref, depth)
    }

    pub fn cron_triggers(&self) -> impl Iterator<Item = &PolicyTrigger> {
        self.when
            .iter()
            .filter(|trigger| trigger.event == PolicyEvent::OnCron)
    }
}

/// Targets of policies and project actions must be workflows
fn validate_workflow_target(
    ctx: &mut BuildContext,
    template_ref: &TemplateRef,
    depth: usize,
) -> TemplateResult<()> {
    let child = ctx.child(&template_ref.template, depth + 1)?;
    if child.template_type() != TemplateType::Workflow {
        return Err(TemplateError::invalid(format!(
            "template '{}' must be of type: workflow",
            child.name()
        )));
    }
    validate_receiver_params_partial(
        child.name(),
        child.inputs(),
        &template_ref.arguments,
        &ParamMap::new(),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectAssets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectPublish {
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectTemplate {
    #[serde(flatten)]
    pub base: BaseTemplate,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, TemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<ProjectAssets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<ProjectPublish>,
}

impl ProjectTemplate {
    pub fn validate(&self) -> TemplateResult<()> {
        self.base.validate(true)?;
        for (name, action) in &self.actions {
            validate_reference_name("action", name).map_err(|e| e.at("actions"))?;
            action
                .validate()
                .map_err(|e| e.at(format!("actions.{name}")))?;
        }
        if let Some(assets) = &self.assets {
            for (field, path) in [("icon", &assets.icon), ("detail", &assets.detail)] {
                if let Some(path) = path {
                    if path.starts_with('/') || path.split('/').any(|part| part == "..") {
                        return Err(TemplateError::invalid(format!(
                            "assets.{field} must be a path inside the repository, got '{path}'"
                        )));
                    }
                }
            }
        }
        if let Some(publish) = &self.publish {
            if publish.branches.iter().any(|b| b.trim().is_empty()) {
                return Err(TemplateError::invalid("publish.branches cannot contain empty names"));
            }
        }
        Ok(())
    }

    pub fn validate_context(&self, ctx: &mut BuildContext, depth: usize) -> TemplateResult<()> {
        for (name, action) in &self.actions {
            validate_workflow_target(ctx, action, depth).map_err(|e| e.at(format!("actions.{name}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_triggers() {
        let policy: PolicyTemplate = serde_json::from_value(json!({
            "type": "policy", "version": 1, "name": "nightly",
            "template": "ci",
            "when": [
                {"event": "on_push"},
                {"event": "on_cron", "schedule": "0 2 * * *", "timezone": "UTC"}
            ],
            "notifications": [{"when": ["on_failure"], "whom": ["team@example.com"]}]
        }))
        .unwrap();
        policy.validate().unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.cron_triggers().count(), 1);

        let bad: PolicyTemplate = serde_json::from_value(json!({
            "type": "policy", "version": 1, "name": "nightly",
            "template": "ci",
            "when": [{"event": "on_cron", "schedule": "@daily"}]
        }))
        .unwrap();
        assert_eq!(
            bad.validate().unwrap_err().to_string(),
            "when[0]: on_cron trigger requires a 5-field 'schedule'"
        );
    }

    #[test]
    fn test_project_assets_stay_in_repo() {
        let project: ProjectTemplate = serde_json::from_value(json!({
            "type": "project", "version": 1, "name": "shop",
            "actions": {"run": {"template": "ci"}},
            "assets": {"icon": "../secrets.png"}
        }))
        .unwrap();
        assert!(project.validate().is_err());
    }
}
