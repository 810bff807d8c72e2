//! Lifecycle hooks fanned out to every configured plugin, in order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::client::PluginClient;
use super::errors::PluginResult;
use crate::config::PluginsConfig;
use crate::taskset::{AgentTask, TaskResult};
use crate::template::Arguments;
use crate::workflow::{NodeStatus, Workflow};

pub const WORKFLOW_PRE_OPERATE: &str = "workflow.preOperate";
pub const WORKFLOW_POST_OPERATE: &str = "workflow.postOperate";
pub const NODE_PRE_EXECUTE: &str = "node.preExecute";
pub const NODE_POST_EXECUTE: &str = "node.postExecute";
pub const PARAMETERS_PRE_SUBSTITUTION: &str = "parameters.preSubstitution";
pub const TEMPLATE_EXECUTE: &str = "template.execute";

/// Identity of the workflow a hook is about
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkflowRef<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub uid: Uuid,
}

impl<'a> From<&'a Workflow> for WorkflowRef<'a> {
    fn from(workflow: &'a Workflow) -> Self {
        Self {
            namespace: workflow.namespace(),
            name: workflow.name(),
            uid: workflow.uid(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WorkflowArgs<'a> {
    workflow: &'a Workflow,
}

#[derive(Debug, Serialize)]
struct NodeArgs<'a> {
    workflow: WorkflowRef<'a>,
    node: &'a NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodePreExecuteReply {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ParametersArgs<'a> {
    workflow: WorkflowRef<'a>,
    parameters: &'a Arguments,
}

#[derive(Debug, Default, Deserialize)]
struct ParametersReply {
    #[serde(default)]
    parameters: Option<Arguments>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateExecuteArgs<'a> {
    workflow: WorkflowRef<'a>,
    node_id: &'a str,
    task: &'a AgentTask,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateExecuteReply {
    #[serde(default)]
    node: Option<TaskResult>,
}

#[derive(Debug, Default)]
pub struct PluginSet {
    plugins: Vec<PluginClient>,
}

impl PluginSet {
    pub fn new(plugins: Vec<PluginClient>) -> Self {
        Self { plugins }
    }

    pub fn from_config(config: &PluginsConfig) -> PluginResult<Self> {
        let plugins = config
            .endpoints
            .iter()
            .map(|endpoint| {
                PluginClient::new(
                    endpoint.name.clone(),
                    endpoint.address.clone(),
                    Duration::from_secs(config.connect_timeout_seconds),
                    Duration::from_secs(config.request_timeout_seconds),
                )
            })
            .collect::<PluginResult<Vec<_>>>()?;
        Ok(Self::new(plugins))
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn plugins(&self) -> &[PluginClient] {
        &self.plugins
    }

    async fn notify<Req: Serialize + Sync>(&self, method: &str, request: &Req) -> PluginResult<()> {
        for plugin in &self.plugins {
            plugin.call::<_, Value>(method, request).await?;
        }
        Ok(())
    }

    pub async fn workflow_pre_operate(&self, workflow: &Workflow) -> PluginResult<()> {
        self.notify(WORKFLOW_PRE_OPERATE, &WorkflowArgs { workflow })
            .await
    }

    pub async fn workflow_post_operate(&self, workflow: &Workflow) -> PluginResult<()> {
        self.notify(WORKFLOW_POST_OPERATE, &WorkflowArgs { workflow })
            .await
    }

    /// Pod annotations requested by plugins; later plugins override earlier ones
    pub async fn node_pre_execute(
        &self,
        workflow: &Workflow,
        node: &NodeStatus,
    ) -> PluginResult<BTreeMap<String, String>> {
        let request = NodeArgs {
            workflow: workflow.into(),
            node,
        };
        let mut annotations = BTreeMap::new();
        for plugin in &self.plugins {
            if let Some(reply) = plugin
                .call::<_, NodePreExecuteReply>(NODE_PRE_EXECUTE, &request)
                .await?
            {
                annotations.extend(reply.annotations);
            }
        }
        Ok(annotations)
    }

    pub async fn node_post_execute(&self, workflow: &Workflow, node: &NodeStatus) -> PluginResult<()> {
        self.notify(
            NODE_POST_EXECUTE,
            &NodeArgs {
                workflow: workflow.into(),
                node,
            },
        )
        .await
    }

    /// Let plugins rewrite workflow arguments before they are substituted.
    /// Each plugin sees the output of the previous one.
    pub async fn parameters_pre_substitution(
        &self,
        workflow: WorkflowRef<'_>,
        parameters: Arguments,
    ) -> PluginResult<Arguments> {
        let mut current = parameters;
        for plugin in &self.plugins {
            let reply = plugin
                .call::<_, ParametersReply>(
                    PARAMETERS_PRE_SUBSTITUTION,
                    &ParametersArgs {
                        workflow,
                        parameters: &current,
                    },
                )
                .await?;
            if let Some(replaced) = reply.and_then(|r| r.parameters) {
                current = replaced;
            }
        }
        Ok(current)
    }

    /// Execute an agent task. The first plugin returning a result wins.
    pub async fn execute_template(
        &self,
        workflow: WorkflowRef<'_>,
        node_id: &str,
        task: &AgentTask,
    ) -> PluginResult<Option<TaskResult>> {
        let request = TemplateExecuteArgs {
            workflow,
            node_id,
            task,
        };
        for plugin in &self.plugins {
            let reply = plugin
                .call::<_, TemplateExecuteReply>(TEMPLATE_EXECUTE, &request)
                .await?;
            if let Some(result) = reply.and_then(|r| r.node) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}
