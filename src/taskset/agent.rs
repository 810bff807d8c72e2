//! Executes pending agent tasks and reports their results.
//!
//! HTTP tasks are sent directly; plugin tasks are handed to the plugin set's
//! `template.execute` hook. A task nobody can execute fails its node.

use reqwest::{Client, Method};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AgentTask, TaskResult, TaskSetManager, TaskSetResult};
use crate::plugin::{PluginSet, WorkflowRef};
use crate::resilience::classifier::is_transient_reqwest;
use crate::template::AgentExecutor;
use crate::workflow::NodeIo;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TaskAgent {
    manager: TaskSetManager,
    client: Client,
    plugins: Option<Arc<PluginSet>>,
}

impl TaskAgent {
    pub fn new(manager: TaskSetManager) -> Self {
        Self {
            manager,
            client: Client::new(),
            plugins: None,
        }
    }

    pub fn with_plugins(mut self, plugins: Arc<PluginSet>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Run every task of the workflow's task set that has no result yet.
    /// Returns how many tasks were executed.
    pub async fn run_pending(&self, workflow: WorkflowRef<'_>) -> TaskSetResult<usize> {
        let Some(task_set) = self
            .manager
            .store()
            .get(workflow.namespace, workflow.name)
            .await?
        else {
            return Ok(0);
        };

        let pending: Vec<_> = task_set.pending().cloned().collect();
        for entry in &pending {
            let result = self.execute(workflow, &entry.node_id, &entry.task).await;
            debug!(
                workflow = %workflow.name,
                node_id = %entry.node_id,
                phase = %result.phase,
                "🤖 Agent task finished"
            );
            self.manager
                .record_result(workflow.namespace, workflow.name, &entry.node_id, &result)
                .await?;
        }
        Ok(pending.len())
    }

    pub async fn execute(&self, workflow: WorkflowRef<'_>, node_id: &str, task: &AgentTask) -> TaskResult {
        match &task.executor {
            AgentExecutor::Http {
                url,
                method,
                headers,
                body,
                timeout_seconds,
            } => {
                let timeout = timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_HTTP_TIMEOUT);
                self.execute_http(url, method, headers, body.as_deref(), timeout)
                    .await
            }
            AgentExecutor::Plugin { name, .. } => {
                let Some(plugins) = &self.plugins else {
                    return TaskResult::failed(format!("no plugin configured to run {name}"));
                };
                match plugins.execute_template(workflow, node_id, task).await {
                    Ok(Some(result)) => result,
                    Ok(None) => TaskResult::failed(format!("no plugin executed {name}")),
                    Err(e) => {
                        warn!(plugin = %name, error = %e, "Plugin task failed");
                        TaskResult::errored(e.to_string())
                    }
                }
            }
        }
    }

    async fn execute_http(
        &self,
        url: &str,
        method: &str,
        headers: &std::collections::BTreeMap<String, String>,
        body: Option<&str>,
        timeout: Duration,
    ) -> TaskResult {
        let method = match Method::from_str(&method.to_uppercase()) {
            Ok(method) => method,
            Err(e) => return TaskResult::failed(format!("invalid HTTP method {method}: {e}")),
        };
        let mut request = self.client.request(method, url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if status.is_success() {
                    let mut outputs = NodeIo::default();
                    outputs
                        .parameters
                        .insert("status".to_string(), status.as_u16().to_string());
                    outputs.parameters.insert("result".to_string(), text);
                    TaskResult::succeeded(Some(outputs))
                } else {
                    TaskResult::failed(format!("{url} returned {status}: {text}"))
                }
            }
            Err(e) if is_transient_reqwest(&e) => TaskResult::errored(e.to_string()),
            Err(e) => TaskResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NodePhase;
    use crate::taskset::{InMemoryTaskSetStore, TaskOwner, TaskSetStore};
    use crate::template::Arguments;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_task(url: String, method: &str) -> AgentTask {
        let mut headers = BTreeMap::new();
        headers.insert("x-token".to_string(), "abc".to_string());
        AgentTask {
            name: "call".into(),
            executor: AgentExecutor::Http {
                url,
                method: method.to_string(),
                headers,
                body: Some("{}".into()),
                timeout_seconds: Some(5),
            },
            arguments: Arguments::new(),
        }
    }

    #[tokio::test]
    async fn test_run_pending_records_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryTaskSetStore::new());
        let manager = TaskSetManager::new(store.clone());
        let uid = Uuid::new_v4();
        let owner = TaskOwner {
            namespace: "ci",
            name: "release",
            uid,
        };
        manager
            .schedule(owner, "ok", &http_task(format!("{}/hook", server.uri()), "post"))
            .await
            .unwrap();
        manager
            .schedule(owner, "bad", &http_task(format!("{}/broken", server.uri()), "GET"))
            .await
            .unwrap();
        manager
            .schedule(
                owner,
                "plugin",
                &AgentTask {
                    name: "notify".into(),
                    executor: AgentExecutor::Plugin {
                        name: "slack".into(),
                        args: Value::Null,
                    },
                    arguments: Arguments::new(),
                },
            )
            .await
            .unwrap();

        let agent = TaskAgent::new(manager.clone());
        let workflow = WorkflowRef {
            namespace: "ci",
            name: "release",
            uid,
        };
        assert_eq!(agent.run_pending(workflow).await.unwrap(), 3);
        assert_eq!(agent.run_pending(workflow).await.unwrap(), 0);

        let ok = manager.result("ci", "release", "ok").await.unwrap().unwrap();
        assert_eq!(ok.phase, NodePhase::Succeeded);
        assert_eq!(ok.outputs.unwrap().parameters["result"], "accepted");

        let bad = manager.result("ci", "release", "bad").await.unwrap().unwrap();
        assert_eq!(bad.phase, NodePhase::Failed);

        let plugin = manager.result("ci", "release", "plugin").await.unwrap().unwrap();
        assert_eq!(plugin.phase, NodePhase::Failed);
        assert!(store.get("ci", "release").await.unwrap().unwrap().pending().next().is_none());
    }
}
