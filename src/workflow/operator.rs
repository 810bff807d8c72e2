//! # Workflow Operator
//!
//! One reconcile pass over a workflow: walk the stored template, create pods
//! for runnable containers, read back finished pods, and roll node phases up
//! to the workflow.
//!
//! ## Node tree
//!
//! | template / slot     | node name                | node type   |
//! |---------------------|--------------------------|-------------|
//! | entrypoint          | `{workflow}`             | Steps/Retry |
//! | step group `i`      | `{parent}[i]`            | StepGroup   |
//! | step `s`            | `{parent}[i].s`          | Retry/Task  |
//! | attempt `n`         | `{step}(n)`              | Pod         |
//! | dynamic fixtures    | `{parent}.fixtures`      | Fixtures    |
//!
//! Node ids are derived from the workflow uid and the node name, so a pass
//! can be replayed at any time without duplicating nodes.
//!
//! ## Execution rules
//!
//! - Step groups run one after the other; steps inside a group run together.
//! - After a step fails, only `always_run` steps of later groups run.
//! - A pod that errors for an infrastructure reason gets a sibling attempt
//!   while the retry budget lasts. An admission rejection holds back every
//!   other pod creation for the rest of the pass.
//! - `terminate`, or a termination-policy breach, stops running pods by
//!   setting their active deadline to zero and fails pending nodes.
//! - Dynamic fixtures launch before the first step group. A fixture is
//!   available once its container succeeded or its pod is running. When the
//!   steps finish, successfully or not, fixture pods are stopped and deleted.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::errors::{RuntimeError, WorkflowError, WorkflowResult};
use super::pod::{
    build_pod, demux_termination_message, pod_name, ArtifactDownload, ArtifactUpload,
};
use super::runtime::{is_retryable_reason, PodPhase, PodRuntime};
use super::types::{node_id, NodeIo, NodeStatus, NodeType, Nodes, Workflow};
use crate::artifacts::{Artifact, ArtifactLocation};
use crate::config::WorkflowConfig;
use crate::constants::{events, StatusCode, TerminalStatus};
use crate::events::publisher::EventPublisher;
use crate::logging::{log_node_operation, log_workflow_operation};
use crate::persistence::{OffloadNodeStatusRepo, PersistenceError};
use crate::plugin::{PluginSet, WorkflowRef};
use crate::repository::{ArtifactRepository, KeyContext, RepositoryError, RepositoryResolver};
use crate::state_machine::actions::{
    Entity, PublishTransitionEventAction, StateAction, Transition,
};
use crate::state_machine::{NodeEvent, NodePhase, NodeStateMachine, WorkflowPhase};
use crate::taskset::{AgentTask, TaskOwner, TaskSetManager};
use crate::template::params::param_name;
use crate::template::{
    substitute, Arguments, ContainerTemplate, EmbeddedStep, EmbeddedTemplate, EmbeddedWorkflow,
    StepFlags, TemplateError,
};

const TERMINATED_MESSAGE: &str = "workflow terminated";
const FIXTURE_RELEASED: &str = "fixture released";

/// What the controller should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub phase: WorkflowPhase,
    /// Reconcile again later; false once the workflow is completed
    pub requeue: bool,
    /// A pod admission was rejected; requeue with backoff instead of the
    /// regular interval
    pub backoff: bool,
}

impl ReconcileOutcome {
    fn completed(phase: WorkflowPhase) -> Self {
        Self {
            phase,
            requeue: false,
            backoff: false,
        }
    }
}

/// Artifacts and parameters produced by completed steps, visible to later
/// step groups as `steps.NAME.outputs.*` and `fixtures.NAME.outputs.*`
#[derive(Debug, Clone, Default)]
struct Scope {
    artifacts: BTreeMap<String, Artifact>,
    parameters: BTreeMap<String, String>,
}

impl Scope {
    fn absorb(&mut self, prefix: &str, outputs: &NodeIo) {
        for artifact in &outputs.artifacts {
            self.artifacts.insert(
                format!("{prefix}.outputs.artifacts.{}", artifact.name),
                artifact.clone(),
            );
        }
        for (name, value) in &outputs.parameters {
            self.parameters
                .insert(format!("{prefix}.outputs.parameters.{name}"), value.clone());
        }
    }
}

#[derive(Debug, Clone)]
struct NodeTransition {
    node_id: String,
    node_name: String,
    from: NodePhase,
    to: NodePhase,
    event: &'static str,
    message: Option<String>,
}

/// State of one reconcile pass
struct Pass<'w> {
    workflow: &'w Workflow,
    nodes: Nodes,
    repository: Option<ArtifactRepository>,
    retry_limit: u32,
    terminating: Option<String>,
    hold_new_pods: bool,
    transitions: Vec<NodeTransition>,
    retries_scheduled: Vec<String>,
}

impl<'w> Pass<'w> {
    fn can_start(&self) -> bool {
        self.terminating.is_none() && !self.workflow.spec.suspend && !self.hold_new_pods
    }

    fn ensure_node(
        &mut self,
        name: &str,
        template_name: &str,
        node_type: NodeType,
        parent: Option<&str>,
    ) -> String {
        let id = node_id(self.workflow.uid(), name);
        self.nodes.entry(id.clone()).or_insert_with(|| {
            NodeStatus::new(id.clone(), name, template_name, NodePhase::Pending).with_type(node_type)
        });
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(p)) {
            parent.add_child(&id);
        }
        id
    }

    fn node(&self, id: &str) -> WorkflowResult<&NodeStatus> {
        self.nodes
            .get(id)
            .ok_or_else(|| TemplateError::internal(format!("node {id} vanished mid-pass")).into())
    }

    fn node_mut(&mut self, id: &str) -> WorkflowResult<&mut NodeStatus> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| TemplateError::internal(format!("node {id} vanished mid-pass")).into())
    }

    fn phase(&self, id: &str) -> WorkflowResult<NodePhase> {
        Ok(self.node(id)?.phase)
    }

    fn apply(&mut self, id: &str, event: NodeEvent) -> WorkflowResult<NodePhase> {
        let node = self.node_mut(id)?;
        let from = NodeStateMachine::apply(node, &event)?;
        let to = node.phase;
        let node_name = node.name.clone();
        if from != to {
            self.transitions.push(NodeTransition {
                node_id: id.to_string(),
                node_name,
                from,
                to,
                event: event.event_type(),
                message: event.message().map(str::to_string),
            });
        }
        Ok(to)
    }

    /// Mark a parent node running if it has not started yet
    fn start(&mut self, id: &str) -> WorkflowResult<()> {
        if self.phase(id)? == NodePhase::Pending {
            self.apply(id, NodeEvent::Start)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct WorkflowOperator {
    runtime: Arc<dyn PodRuntime>,
    offloads: Arc<dyn OffloadNodeStatusRepo>,
    resolver: Arc<RepositoryResolver>,
    tasksets: Option<TaskSetManager>,
    plugins: Option<Arc<PluginSet>>,
    publisher: EventPublisher,
    config: WorkflowConfig,
}

impl WorkflowOperator {
    pub fn new(
        runtime: Arc<dyn PodRuntime>,
        offloads: Arc<dyn OffloadNodeStatusRepo>,
        resolver: Arc<RepositoryResolver>,
        publisher: EventPublisher,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            runtime,
            offloads,
            resolver,
            tasksets: None,
            plugins: None,
            publisher,
            config,
        }
    }

    pub fn with_tasksets(mut self, tasksets: TaskSetManager) -> Self {
        self.tasksets = Some(tasksets);
        self
    }

    pub fn with_plugins(mut self, plugins: Arc<PluginSet>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn PodRuntime> {
        &self.runtime
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Run one reconcile pass. Fatal errors complete the workflow with phase
    /// `Error`; other errors are returned for the controller to retry.
    pub async fn operate(&self, workflow: &mut Workflow) -> WorkflowResult<ReconcileOutcome> {
        if workflow.is_completed() {
            return Ok(ReconcileOutcome::completed(workflow.status.phase));
        }

        if let Some(plugins) = &self.plugins {
            if let Err(e) = plugins.workflow_pre_operate(workflow).await {
                warn!(workflow = %workflow.name(), error = %e, "workflow.preOperate hook failed");
            }
        }

        let outcome = match self.reconcile(workflow).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                self.finish(workflow, WorkflowPhase::Error, Some(e.to_string()))
                    .await;
                ReconcileOutcome::completed(WorkflowPhase::Error)
            }
            Err(e) => return Err(e),
        };

        if let Some(plugins) = &self.plugins {
            if let Err(e) = plugins.workflow_post_operate(workflow).await {
                warn!(workflow = %workflow.name(), error = %e, "workflow.postOperate hook failed");
            }
        }
        Ok(outcome)
    }

    async fn reconcile(&self, workflow: &mut Workflow) -> WorkflowResult<ReconcileOutcome> {
        let now = Utc::now();

        if let Some(version) = workflow.status.offload_node_status_version.clone() {
            workflow.status.nodes = self.offloads.get(workflow.uid(), &version).await?;
        }

        if workflow.status.started_at.is_none() {
            workflow.status.started_at = Some(now);
            workflow.status.phase = WorkflowPhase::Running;
            self.publish(events::WORKFLOW_STARTED, workflow).await;
            log_workflow_operation(
                "start",
                Some(&workflow.uid().to_string()),
                Some(workflow.name()),
                Some(workflow.namespace()),
                "Running",
                None,
            );
        }

        if workflow.status.stored_template.is_none() {
            let arguments = self.pre_substitution_arguments(workflow).await;
            let stored = substitute(&workflow.spec.template, &arguments, &workflow.spec.fixtures)?;
            workflow.status.stored_template = Some(stored);
        }

        let reference = match workflow.status.artifact_repository_ref.clone() {
            Some(reference) => reference,
            None => {
                let resolved = self
                    .resolver
                    .resolve(workflow.spec.artifact_repository_ref.as_ref(), workflow.namespace())
                    .await?;
                workflow.status.artifact_repository_ref = Some(resolved.clone());
                resolved
            }
        };
        let repository = match self.resolver.get(&reference).await {
            Ok(mut repository) => {
                repository
                    .key_format
                    .get_or_insert_with(|| self.config.key_format.clone());
                Some(repository)
            }
            Err(RepositoryError::NotConfigured) => None,
            Err(e) => return Err(e.into()),
        };

        let (cost, violation) = self.check_termination_policy(workflow, now);
        workflow.status.estimated_cost_cents = cost;
        let terminating = if workflow.spec.terminate {
            Some(TERMINATED_MESSAGE.to_string())
        } else {
            violation.as_ref().map(|v| v.message.clone())
        };

        let nodes = std::mem::take(&mut workflow.status.nodes);
        let snapshot = workflow.clone();
        let template = snapshot
            .status
            .stored_template
            .as_ref()
            .ok_or_else(|| TemplateError::internal("stored template missing after substitution"))?;

        let mut pass = Pass {
            workflow: &snapshot,
            nodes,
            repository,
            retry_limit: snapshot
                .spec
                .retry_limit
                .unwrap_or(self.config.default_retry_limit),
            terminating,
            hold_new_pods: false,
            transitions: Vec::new(),
            retries_scheduled: Vec::new(),
        };
        let result = self
            .execute_template(
                &mut pass,
                snapshot.name().to_string(),
                template,
                &snapshot.spec.arguments,
                StepFlags::default(),
                &Scope::default(),
                None,
            )
            .await;

        let Pass {
            nodes,
            transitions,
            retries_scheduled,
            hold_new_pods,
            ..
        } = pass;
        workflow.status.nodes = nodes;
        self.publish_transitions(workflow, &transitions).await;
        for name in &retries_scheduled {
            self.publish_with(events::NODE_RETRY_SCHEDULED, workflow, json!({ "node": name }))
                .await;
        }
        let root_phase = result?;

        let outcome = if root_phase.is_completed() {
            let mut phase = WorkflowPhase::from_node(root_phase);
            let root_message = workflow
                .node_by_name(workflow.name())
                .and_then(|node| node.message.clone());
            let message = if let Some(violation) = violation {
                phase = WorkflowPhase::Failed;
                let message = violation.message.clone();
                workflow.status.terminal = Some(violation);
                Some(message)
            } else if workflow.spec.terminate {
                phase = WorkflowPhase::Failed;
                Some(TERMINATED_MESSAGE.to_string())
            } else {
                root_message
            };
            self.finish(workflow, phase, message).await;
            ReconcileOutcome::completed(phase)
        } else {
            workflow.status.phase = WorkflowPhase::Running;
            ReconcileOutcome {
                phase: WorkflowPhase::Running,
                requeue: true,
                backoff: hold_new_pods,
            }
        };

        self.persist_nodes(workflow).await?;
        Ok(outcome)
    }

    async fn pre_substitution_arguments(&self, workflow: &Workflow) -> Arguments {
        let arguments = workflow.spec.arguments.clone();
        let Some(plugins) = &self.plugins else {
            return arguments;
        };
        match plugins
            .parameters_pre_substitution(WorkflowRef::from(workflow), arguments.clone())
            .await
        {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(workflow = %workflow.name(), error = %e, "parameters.preSubstitution hook failed");
                arguments
            }
        }
    }

    /// Accumulated cost and, when a limit is exceeded, the terminal status
    fn check_termination_policy(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> (f64, Option<TerminalStatus>) {
        let cost: f64 = workflow
            .status
            .nodes
            .values()
            .filter(|node| node.node_type == NodeType::Pod)
            .map(|node| {
                self.config
                    .cost_model
                    .cost_cents(node.cpu_cores, node.mem_mib, node.elapsed_seconds(now))
            })
            .sum();

        let policy = workflow
            .status
            .stored_template
            .as_ref()
            .unwrap_or(&workflow.spec.template)
            .termination_policy();
        let Some(policy) = policy else {
            return (cost, None);
        };

        if let Some(limit) = policy.spending_limit_cents() {
            if cost > limit as f64 {
                let status = TerminalStatus::new(
                    StatusCode::LimitSpendingExceeded,
                    format!("spending limit of {limit} cents exceeded"),
                )
                .with_detail(format!("estimated cost {cost:.2} cents"));
                return (cost, Some(status));
            }
        }
        if let (Some(limit), Some(started)) =
            (policy.time_limit_seconds(), workflow.status.started_at)
        {
            let elapsed = (now - started).num_seconds().max(0) as u64;
            if elapsed > limit {
                let status = TerminalStatus::new(
                    StatusCode::LimitTimeExceeded,
                    format!("time limit of {limit} seconds exceeded"),
                )
                .with_detail(format!("running for {elapsed} seconds"));
                return (cost, Some(status));
            }
        }
        (cost, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_template<'b, 'w: 'b>(
        &'b self,
        pass: &'b mut Pass<'w>,
        name: String,
        template: &'b EmbeddedTemplate,
        arguments: &'b Arguments,
        flags: StepFlags,
        scope: &'b Scope,
        parent: Option<String>,
    ) -> BoxFuture<'b, WorkflowResult<NodePhase>> {
        async move {
            match template {
                EmbeddedTemplate::Container(container) => {
                    self.execute_container(pass, &name, container, arguments, flags, scope, parent.as_deref())
                        .await
                }
                EmbeddedTemplate::Workflow(workflow) => {
                    self.execute_steps(pass, &name, workflow, scope, parent.as_deref())
                        .await
                }
                EmbeddedTemplate::Deployment(deployment) => Err(TemplateError::invalid(format!(
                    "deployment template '{}' cannot run as a workflow step",
                    deployment.base.name
                ))
                .into()),
            }
        }
        .boxed()
    }

    async fn execute_steps(
        &self,
        pass: &mut Pass<'_>,
        name: &str,
        template: &EmbeddedWorkflow,
        scope: &Scope,
        parent: Option<&str>,
    ) -> WorkflowResult<NodePhase> {
        let id = pass.ensure_node(name, &template.base.name, NodeType::Steps, parent);
        let mut scope = scope.clone();

        if template.fixtures.iter().flatten().any(|(_, f)| f.is_dynamic()) {
            let phase = self
                .execute_fixtures(pass, name, template, &mut scope, &id)
                .await?;
            if !phase.is_completed() {
                pass.start(&id)?;
                return pass.phase(&id);
            }
            if !phase.is_successful() {
                if !pass.phase(&id)?.is_completed() {
                    self.release_fixtures(pass, name).await?;
                    pass.apply(&id, NodeEvent::Fail("fixtures failed".to_string()))?;
                }
                return pass.phase(&id);
            }
        }

        let mut failed_step: Option<String> = None;
        for (index, group) in template.steps.iter().enumerate() {
            let after_failure = failed_step.is_some();
            let runnable = group
                .values()
                .map(EmbeddedStep::parsed_flags)
                .collect::<Result<Vec<_>, _>>()?;
            if after_failure && !runnable.iter().any(|flags| flags.always_run) {
                continue;
            }
            let group_name = format!("{name}[{index}]");
            let (phase, failed) = self
                .execute_group(pass, &group_name, group, &mut scope, after_failure, &id)
                .await?;
            if !phase.is_completed() {
                pass.start(&id)?;
                return pass.phase(&id);
            }
            if failed_step.is_none() {
                failed_step = failed;
            }
        }

        if pass.phase(&id)?.is_completed() {
            return pass.phase(&id);
        }
        self.release_fixtures(pass, name).await?;
        match failed_step {
            Some(step) => pass.apply(&id, NodeEvent::Fail(format!("child '{step}' failed"))),
            None => {
                let outputs = workflow_outputs(template, &scope);
                pass.node_mut(&id)?.outputs = (!outputs.is_empty()).then_some(outputs);
                pass.apply(&id, NodeEvent::Succeed)
            }
        }
    }

    /// Run one parallel step group. Returns the group phase and the name of
    /// the first failed step, if any.
    async fn execute_group(
        &self,
        pass: &mut Pass<'_>,
        group_name: &str,
        group: &BTreeMap<String, EmbeddedStep>,
        scope: &mut Scope,
        after_failure: bool,
        parent: &str,
    ) -> WorkflowResult<(NodePhase, Option<String>)> {
        let id = pass.ensure_node(group_name, "", NodeType::StepGroup, Some(parent));
        pass.start(&id)?;

        let mut pending = false;
        let mut failed: Option<String> = None;
        let mut produced = Vec::new();

        for (step_name, step) in group {
            let flags = step.parsed_flags()?;
            if after_failure && !flags.always_run {
                continue;
            }
            let child_name = format!("{group_name}.{step_name}");

            if flags.skipped {
                let child = pass.ensure_node(&child_name, "", NodeType::Skipped, Some(&id));
                if pass.phase(&child)? == NodePhase::Pending {
                    pass.apply(&child, NodeEvent::Skip)?;
                }
                continue;
            }

            let phase = if step.executor.is_some() {
                self.execute_task(pass, &child_name, step_name, step, &id)
                    .await?
            } else {
                let template = step.template.as_deref().ok_or_else(|| {
                    TemplateError::invalid(format!("step '{step_name}' has no template"))
                })?;
                self.execute_template(
                    pass,
                    child_name.clone(),
                    template,
                    &step.arguments,
                    flags,
                    scope,
                    Some(id.clone()),
                )
                .await?
            };

            let child_id = node_id(pass.workflow.uid(), &child_name);
            if !phase.is_completed() {
                pending = true;
                continue;
            }
            let child = pass.node_mut(&child_id)?;
            if phase.is_failure() && flags.ignore_error {
                child.ignored = true;
            }
            if child.counts_as_success() {
                if let Some(outputs) = &child.outputs {
                    produced.push((format!("steps.{step_name}"), outputs.clone()));
                }
            } else if failed.is_none() {
                failed = Some(step_name.clone());
            }
        }

        for (prefix, outputs) in &produced {
            scope.absorb(prefix, outputs);
        }

        let node = pass.node_mut(&id)?;
        node.outbound = node.children.clone();

        if pending {
            return Ok((NodePhase::Running, failed));
        }
        if !pass.phase(&id)?.is_completed() {
            match &failed {
                Some(step) => pass.apply(&id, NodeEvent::Fail(format!("step '{step}' failed")))?,
                None => pass.apply(&id, NodeEvent::Succeed)?,
            };
        }
        Ok((pass.phase(&id)?, failed))
    }

    /// Launch dynamic fixtures group by group. The fixtures node succeeds
    /// once every fixture is available; later passes only read their outputs.
    async fn execute_fixtures(
        &self,
        pass: &mut Pass<'_>,
        name: &str,
        template: &EmbeddedWorkflow,
        scope: &mut Scope,
        parent: &str,
    ) -> WorkflowResult<NodePhase> {
        let fixtures_name = format!("{name}.fixtures");
        let id = pass.ensure_node(&fixtures_name, "", NodeType::Fixtures, Some(parent));
        let launched = pass.phase(&id)?.is_completed();
        if !launched {
            pass.start(&id)?;
        }

        for (index, group) in template.fixtures.iter().enumerate() {
            let mut pending = false;
            let mut failed = false;
            let mut produced = Vec::new();
            for (fixture_name, fixture) in group {
                let Some(fixture_template) = fixture.template.as_deref() else {
                    continue;
                };
                let child_name = format!("{fixtures_name}[{index}].{fixture_name}");
                let child_id = node_id(pass.workflow.uid(), &child_name);
                if launched {
                    if let Some(outputs) = pass.nodes.get(&child_id).and_then(|n| n.outputs.clone()) {
                        produced.push((format!("fixtures.{fixture_name}"), outputs));
                    }
                    continue;
                }
                let phase = self
                    .execute_template(
                        pass,
                        child_name.clone(),
                        fixture_template,
                        &fixture.arguments,
                        StepFlags::default(),
                        scope,
                        Some(id.clone()),
                    )
                    .await?;
                if phase.is_successful() {
                    if let Some(outputs) = &pass.node(&child_id)?.outputs {
                        produced.push((format!("fixtures.{fixture_name}"), outputs.clone()));
                    }
                } else if phase.is_completed() {
                    failed = true;
                } else if !self.fixture_running(pass, &child_id).await? {
                    pending = true;
                }
            }
            for (prefix, outputs) in &produced {
                scope.absorb(prefix, outputs);
            }
            if pending {
                return Ok(NodePhase::Running);
            }
            if failed {
                if !pass.phase(&id)?.is_completed() {
                    pass.apply(&id, NodeEvent::Fail("dynamic fixture failed".to_string()))?;
                }
                return pass.phase(&id);
            }
        }

        if !pass.phase(&id)?.is_completed() {
            pass.apply(&id, NodeEvent::Succeed)?;
        }
        pass.phase(&id)
    }

    /// Whether the latest attempt of a fixture has a running pod
    async fn fixture_running(&self, pass: &Pass<'_>, retry_id: &str) -> WorkflowResult<bool> {
        let Some(attempt) = pass.node(retry_id)?.children.last() else {
            return Ok(false);
        };
        let Some(pod) = pass.node(attempt)?.pod_name.clone() else {
            return Ok(false);
        };
        let observation = self.runtime.get_pod(pass.workflow.namespace(), &pod).await?;
        Ok(matches!(observation, Some(o) if o.phase == PodPhase::Running))
    }

    /// Tear down the dynamic fixtures of the steps template `name`: running
    /// fixture attempts are closed as released, unlaunched ones are skipped,
    /// and every fixture pod is deleted.
    async fn release_fixtures(&self, pass: &mut Pass<'_>, name: &str) -> WorkflowResult<()> {
        let fixtures_id = node_id(pass.workflow.uid(), &format!("{name}.fixtures"));
        let Some(retry_ids) = pass.nodes.get(&fixtures_id).map(|n| n.children.clone()) else {
            return Ok(());
        };
        let workflow = pass.workflow;
        let namespace = workflow.namespace();
        let mut released = 0usize;

        for retry_id in retry_ids {
            for attempt_id in pass.node(&retry_id)?.children.clone() {
                match pass.phase(&attempt_id)? {
                    NodePhase::Pending => {
                        pass.apply(&attempt_id, NodeEvent::Skip)?;
                    }
                    NodePhase::Running => {
                        pass.node_mut(&attempt_id)?.message = Some(FIXTURE_RELEASED.to_string());
                        pass.apply(&attempt_id, NodeEvent::Succeed)?;
                    }
                    _ => {}
                }
                let Some(pod) = pass.node(&attempt_id)?.pod_name.clone() else {
                    continue;
                };
                match self.runtime.delete_pod(namespace, &pod).await {
                    Ok(()) => released += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            match pass.phase(&retry_id)? {
                NodePhase::Pending => {
                    pass.apply(&retry_id, NodeEvent::Skip)?;
                }
                NodePhase::Running => {
                    pass.node_mut(&retry_id)?.message = Some(FIXTURE_RELEASED.to_string());
                    pass.apply(&retry_id, NodeEvent::Succeed)?;
                }
                _ => {}
            }
        }

        if released > 0 {
            log_node_operation(
                "fixtures_released",
                Some(&workflow.uid().to_string()),
                Some(&fixtures_id),
                Some(name),
                "Released",
                Some(&format!("{released} pods deleted")),
            );
        }
        Ok(())
    }

    /// A container step: a retry node whose children are the pod attempts
    #[allow(clippy::too_many_arguments)]
    async fn execute_container(
        &self,
        pass: &mut Pass<'_>,
        name: &str,
        container: &ContainerTemplate,
        arguments: &Arguments,
        flags: StepFlags,
        scope: &Scope,
        parent: Option<&str>,
    ) -> WorkflowResult<NodePhase> {
        let retry_id = pass.ensure_node(name, &container.base.name, NodeType::Retry, parent);
        if pass.phase(&retry_id)?.is_completed() {
            return pass.phase(&retry_id);
        }

        loop {
            let attempts = pass.node(&retry_id)?.children.len();
            let index = attempts.saturating_sub(1);
            let attempt_name = format!("{name}({index})");
            let attempt_id =
                pass.ensure_node(&attempt_name, &container.base.name, NodeType::Pod, Some(&retry_id));

            let phase = self
                .execute_pod(pass, &attempt_id, container, arguments, flags, scope)
                .await?;

            match phase {
                NodePhase::Pending => return pass.phase(&retry_id),
                NodePhase::Running => {
                    pass.start(&retry_id)?;
                    return pass.phase(&retry_id);
                }
                NodePhase::Succeeded | NodePhase::Skipped => {
                    let outputs = pass.node(&attempt_id)?.outputs.clone();
                    pass.node_mut(&retry_id)?.outputs = outputs;
                    return pass.apply(&retry_id, NodeEvent::Succeed);
                }
                NodePhase::Failed => {
                    let message = attempt_message(pass.node(&attempt_id)?);
                    return pass.apply(&retry_id, NodeEvent::Fail(message));
                }
                NodePhase::Error => {
                    let attempts_made = u32::try_from(index + 1).unwrap_or(u32::MAX);
                    if attempts_made > pass.retry_limit || pass.terminating.is_some() {
                        let message = attempt_message(pass.node(&attempt_id)?);
                        return pass.apply(&retry_id, NodeEvent::Error(message));
                    }
                    pass.start(&retry_id)?;
                    let next = format!("{name}({})", index + 1);
                    pass.ensure_node(&next, &container.base.name, NodeType::Pod, Some(&retry_id));
                    pass.retries_scheduled.push(next.clone());
                    debug!(node = %next, "🔁 Scheduled retry attempt");
                    if !pass.can_start() {
                        return pass.phase(&retry_id);
                    }
                }
            }
        }
    }

    async fn execute_pod(
        &self,
        pass: &mut Pass<'_>,
        id: &str,
        container: &ContainerTemplate,
        arguments: &Arguments,
        flags: StepFlags,
        scope: &Scope,
    ) -> WorkflowResult<NodePhase> {
        match pass.phase(id)? {
            NodePhase::Pending => {
                if let Some(message) = pass.terminating.clone() {
                    return pass.apply(id, NodeEvent::Fail(message));
                }
                if !pass.can_start() {
                    return Ok(NodePhase::Pending);
                }
                self.start_pod(pass, id, container, arguments, scope).await
            }
            NodePhase::Running => self.observe_pod(pass, id, flags).await,
            completed => Ok(completed),
        }
    }

    async fn start_pod(
        &self,
        pass: &mut Pass<'_>,
        id: &str,
        container: &ContainerTemplate,
        arguments: &Arguments,
        scope: &Scope,
    ) -> WorkflowResult<NodePhase> {
        let workflow = pass.workflow;
        let node_name = pass.node(id)?.name.clone();
        let name = pod_name(workflow.name(), id, workflow.metadata.generation);
        let downloads = plan_downloads(&node_name, container, arguments, scope)?;
        let uploads = plan_uploads(pass, &node_name, &name, container)?;

        let (cpu_cores, mem_mib) = container.requested_resources();
        let node = pass.node_mut(id)?;
        node.pod_name = Some(name.clone());
        node.cpu_cores = cpu_cores;
        node.mem_mib = mem_mib;
        let inputs = NodeIo {
            parameters: arguments
                .iter()
                .filter_map(|(k, v)| k.strip_prefix("parameters.").map(|k| (k.to_string(), v.clone())))
                .collect(),
            artifacts: downloads.iter().map(|d| d.artifact.clone()).collect(),
        };
        node.inputs = (!inputs.is_empty()).then_some(inputs);
        let planned = NodeIo {
            parameters: BTreeMap::new(),
            artifacts: uploads.iter().map(|u| u.artifact.clone()).collect(),
        };
        node.outputs = (!planned.is_empty()).then_some(planned);

        let node = pass.node(id)?;
        let mut pod = build_pod(
            workflow,
            node,
            container,
            &downloads,
            &uploads,
            &self.config.executor_image,
        )?;
        if let Some(plugins) = &self.plugins {
            match plugins.node_pre_execute(workflow, node).await {
                Ok(annotations) => pod.annotations.extend(annotations),
                Err(e) => warn!(node = %node_name, error = %e, "node.preExecute hook failed"),
            }
        }

        match self.runtime.create_pod(&pod).await {
            Ok(()) | Err(RuntimeError::Conflict { .. }) => {
                log_node_operation(
                    "pod_created",
                    Some(&workflow.uid().to_string()),
                    Some(id),
                    Some(&node_name),
                    "Running",
                    Some(&name),
                );
                pass.apply(id, NodeEvent::Start)
            }
            Err(RuntimeError::Quota { message }) => {
                pass.hold_new_pods = true;
                warn!(node = %node_name, %message, "Pod admission rejected");
                pass.apply(id, NodeEvent::Error(message))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn observe_pod(
        &self,
        pass: &mut Pass<'_>,
        id: &str,
        flags: StepFlags,
    ) -> WorkflowResult<NodePhase> {
        let workflow = pass.workflow;
        let pod = pass
            .node(id)?
            .pod_name
            .clone()
            .ok_or_else(|| TemplateError::internal(format!("running node {id} has no pod")))?;

        if let Some(message) = pass.terminating.clone() {
            match self
                .runtime
                .set_active_deadline(workflow.namespace(), &pod, 0)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            return pass.apply(id, NodeEvent::Fail(message));
        }

        let Some(observation) = self.runtime.get_pod(workflow.namespace(), &pod).await? else {
            return pass.apply(id, NodeEvent::Error(format!("pod {pod} deleted")));
        };

        let phase = match observation.phase {
            PodPhase::Succeeded => {
                let (message, outputs) = match &observation.wait_termination_message {
                    Some(raw) => demux_termination_message(raw)?,
                    None => (String::new(), None),
                };
                let node = pass.node_mut(id)?;
                if let Some(reported) = outputs {
                    let merged = node.outputs.get_or_insert_with(NodeIo::default);
                    merged.parameters.extend(reported.parameters);
                    for artifact in reported.artifacts {
                        merged.upsert_artifact(artifact);
                    }
                }
                if !message.is_empty() {
                    node.message = Some(message);
                }
                pass.apply(id, NodeEvent::Succeed)?
            }
            PodPhase::Failed => {
                let message = observation
                    .message
                    .clone()
                    .or_else(|| observation.reason.clone())
                    .unwrap_or_else(|| "pod failed".to_string());
                if is_retryable_reason(observation.reason.as_deref()) || flags.auto_retry {
                    pass.apply(id, NodeEvent::Error(message))?
                } else {
                    pass.apply(id, NodeEvent::Fail(message))?
                }
            }
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => NodePhase::Running,
        };

        if phase.is_completed() {
            if let Some(plugins) = &self.plugins {
                if let Err(e) = plugins.node_post_execute(workflow, pass.node(id)?).await {
                    warn!(node = %id, error = %e, "node.postExecute hook failed");
                }
            }
        }
        Ok(phase)
    }

    /// A step executed by an agent through the workflow's task set
    async fn execute_task(
        &self,
        pass: &mut Pass<'_>,
        name: &str,
        step_name: &str,
        step: &EmbeddedStep,
        parent: &str,
    ) -> WorkflowResult<NodePhase> {
        let id = pass.ensure_node(name, step_name, NodeType::Task, Some(parent));
        let workflow = pass.workflow;
        let phase = pass.phase(&id)?;
        if phase.is_completed() {
            return Ok(phase);
        }
        if let Some(message) = pass.terminating.clone() {
            return pass.apply(&id, NodeEvent::Fail(message));
        }
        let Some(tasksets) = &self.tasksets else {
            return pass.apply(
                &id,
                NodeEvent::Fail("agent steps need a task set manager".to_string()),
            );
        };
        let Some(executor) = step.executor.clone() else {
            return Err(TemplateError::internal(format!("step {name} has no executor")).into());
        };

        if phase == NodePhase::Pending {
            if !pass.can_start() {
                return Ok(NodePhase::Pending);
            }
            let owner = TaskOwner {
                namespace: workflow.namespace(),
                name: workflow.name(),
                uid: workflow.uid(),
            };
            let task = AgentTask {
                name: step_name.to_string(),
                executor,
                arguments: step.arguments.clone(),
            };
            tasksets.schedule(owner, &id, &task).await?;
            return pass.apply(&id, NodeEvent::Start);
        }

        let Some(result) = tasksets
            .result(workflow.namespace(), workflow.name(), &id)
            .await?
        else {
            return Ok(NodePhase::Running);
        };
        pass.node_mut(&id)?.outputs = result.outputs.clone();
        let message = result.message.clone().unwrap_or_default();
        match result.phase {
            NodePhase::Succeeded | NodePhase::Skipped => pass.apply(&id, NodeEvent::Succeed),
            NodePhase::Failed => pass.apply(&id, NodeEvent::Fail(message)),
            NodePhase::Error => pass.apply(&id, NodeEvent::Error(message)),
            NodePhase::Pending | NodePhase::Running => Ok(NodePhase::Running),
        }
    }

    /// Move the node map to the offload store when it is over the threshold
    async fn persist_nodes(&self, workflow: &mut Workflow) -> WorkflowResult<()> {
        if crate::gc::ensure_artifact_gc_finalizer(workflow) {
            debug!(workflow = %workflow.name(), "Added artifact GC finalizer");
        }
        let size = serde_json::to_vec(&workflow.status.nodes)
            .map_err(PersistenceError::from)?
            .len();
        if size <= self.config.offload_threshold_bytes {
            workflow.status.offload_node_status_version = None;
            return Ok(());
        }
        if !self.offloads.is_enabled() {
            return Err(WorkflowError::TooLarge {
                uid: workflow.uid(),
                size,
                threshold: self.config.offload_threshold_bytes,
            });
        }
        let version = self
            .offloads
            .save(workflow.uid(), workflow.namespace(), &workflow.status.nodes)
            .await?;
        debug!(workflow = %workflow.name(), %version, size, "Offloaded node status");
        workflow.status.offload_node_status_version = Some(version.clone());
        workflow.status.nodes.clear();
        self.publish_with(events::WORKFLOW_OFFLOADED, workflow, json!({ "version": version }))
            .await;
        Ok(())
    }

    async fn finish(&self, workflow: &mut Workflow, phase: WorkflowPhase, message: Option<String>) {
        workflow.status.phase = phase;
        workflow.status.message = message;
        workflow.status.finished_at.get_or_insert_with(Utc::now);
        workflow.status.observed_generation = workflow.metadata.generation;

        let event = match phase {
            WorkflowPhase::Succeeded => events::WORKFLOW_SUCCEEDED,
            WorkflowPhase::Failed => events::WORKFLOW_FAILED,
            _ => events::WORKFLOW_ERRORED,
        };
        self.publish(event, workflow).await;
        log_workflow_operation(
            "finish",
            Some(&workflow.uid().to_string()),
            Some(workflow.name()),
            Some(workflow.namespace()),
            &phase.to_string(),
            workflow.status.message.as_deref(),
        );
    }

    /// Reset a completed workflow so failed parts run again. Successful nodes
    /// and everything under them are kept; the generation is bumped so new
    /// attempts get fresh pod names.
    pub async fn retry(&self, workflow: &mut Workflow) -> WorkflowResult<()> {
        if !workflow.is_completed() {
            return Err(WorkflowError::NotCompleted {
                uid: workflow.uid(),
            });
        }
        if let Some(version) = workflow.status.offload_node_status_version.take() {
            workflow.status.nodes = self.offloads.get(workflow.uid(), &version).await?;
        }

        let kept = successful_subtrees(&workflow.status.nodes);
        workflow.status.nodes.retain(|id, _| kept.contains(id));
        for node in workflow.status.nodes.values_mut() {
            node.children.retain(|child| kept.contains(child));
            node.outbound.retain(|child| kept.contains(child));
        }

        workflow.spec.terminate = false;
        workflow.status.phase = WorkflowPhase::Running;
        workflow.status.finished_at = None;
        workflow.status.message = None;
        workflow.status.terminal = None;
        workflow.metadata.generation += 1;

        info!(
            workflow = %workflow.name(),
            kept = kept.len(),
            generation = workflow.metadata.generation,
            "🔄 Workflow retried"
        );
        self.publish(events::WORKFLOW_RETRIED, workflow).await;
        Ok(())
    }

    async fn publish_transitions(&self, workflow: &Workflow, transitions: &[NodeTransition]) {
        let action = PublishTransitionEventAction::new(self.publisher.clone());
        let uid = workflow.uid().to_string();
        for transition in transitions {
            let to = transition.to.to_string();
            log_node_operation(
                transition.event,
                Some(&uid),
                Some(&transition.node_id),
                Some(&transition.node_name),
                &to,
                transition.message.as_deref(),
            );
            let event = Transition {
                entity: Entity::Node,
                key: &transition.node_id,
                from: transition.from.to_string(),
                to,
                event: transition.event,
                message: transition.message.as_deref(),
            };
            if let Err(e) = action.execute(&event).await {
                warn!(error = %e, action = action.description(), "Transition action failed");
            }
        }
    }

    async fn publish(&self, event: &str, workflow: &Workflow) {
        self.publish_with(event, workflow, json!({})).await;
    }

    async fn publish_with(&self, event: &str, workflow: &Workflow, extra: serde_json::Value) {
        let context = json!({
            "workflow_uid": workflow.uid(),
            "workflow_name": workflow.name(),
            "namespace": workflow.namespace(),
            "phase": workflow.status.phase,
            "extra": extra,
        });
        if let Err(e) = self.publisher.publish(event, context).await {
            warn!(event, error = %e, "Failed to publish workflow event");
        }
    }
}

fn attempt_message(node: &NodeStatus) -> String {
    node.message
        .clone()
        .unwrap_or_else(|| format!("{} did not succeed", node.name))
}

/// Ids of successful nodes and all of their descendants
fn successful_subtrees(nodes: &Nodes) -> BTreeSet<String> {
    let mut kept = BTreeSet::new();
    let mut stack: Vec<&str> = nodes
        .values()
        .filter(|node| node.counts_as_success())
        .map(|node| node.id.as_str())
        .collect();
    while let Some(id) = stack.pop() {
        if !kept.insert(id.to_string()) {
            continue;
        }
        if let Some(node) = nodes.get(id) {
            stack.extend(node.children.iter().map(String::as_str));
        }
    }
    kept
}

fn resolve_input(scope: &Scope, node_name: &str, input: &str, source: &str) -> WorkflowResult<Artifact> {
    let unresolved = || WorkflowError::UnresolvedParameter {
        step: node_name.to_string(),
        name: format!("inputs.artifacts.{input}"),
    };
    match param_name(source) {
        Some(reference) => {
            let mut artifact = scope.artifacts.get(reference).cloned().ok_or_else(unresolved)?;
            artifact.name = input.to_string();
            artifact.from = Some(reference.to_string());
            Ok(artifact)
        }
        None => {
            let location = ArtifactLocation::parse_uri(source).map_err(|_| unresolved())?;
            Ok(Artifact::new(input, location))
        }
    }
}

fn plan_downloads(
    node_name: &str,
    container: &ContainerTemplate,
    arguments: &Arguments,
    scope: &Scope,
) -> WorkflowResult<Vec<ArtifactDownload>> {
    container
        .inputs
        .artifacts
        .iter()
        .map(|(input, declared)| {
            let source = arguments
                .get(&format!("artifacts.{input}"))
                .or(declared.from.as_ref())
                .ok_or_else(|| WorkflowError::UnresolvedParameter {
                    step: node_name.to_string(),
                    name: format!("inputs.artifacts.{input}"),
                })?;
            let artifact = resolve_input(scope, node_name, input, source)?;
            Ok(ArtifactDownload {
                name: input.clone(),
                path: declared
                    .path
                    .clone()
                    .unwrap_or_else(|| format!("/inputs/artifacts/{input}")),
                from: artifact.from.clone(),
                artifact,
            })
        })
        .collect()
}

fn plan_uploads(
    pass: &Pass<'_>,
    node_name: &str,
    pod: &str,
    container: &ContainerTemplate,
) -> WorkflowResult<Vec<ArtifactUpload>> {
    let workflow = pass.workflow;
    let uid = workflow.uid().to_string();
    let context = KeyContext {
        workflow_name: workflow.name(),
        workflow_namespace: workflow.namespace(),
        workflow_uid: &uid,
        pod_name: pod,
    };
    let mut uploads = Vec::new();
    for (name, output) in &container.outputs.artifacts {
        let Some(path) = &output.path else {
            continue;
        };
        let repository =
            pass.repository
                .as_ref()
                .ok_or_else(|| WorkflowError::RepositoryRequired {
                    artifact: format!("{node_name}.outputs.artifacts.{name}"),
                })?;
        let mut artifact = repository.artifact_for(&context, name);
        artifact.archive = output.archive;
        artifact.retention = output.retention.clone();
        artifact.artifact_gc = output.artifact_gc;
        uploads.push(ArtifactUpload {
            name: name.clone(),
            path: path.clone(),
            artifact,
        });
    }
    Ok(uploads)
}

/// Workflow outputs re-exported from step outputs via `from`
fn workflow_outputs(template: &EmbeddedWorkflow, scope: &Scope) -> NodeIo {
    let mut outputs = NodeIo::default();
    for (name, output) in &template.outputs.artifacts {
        let Some(reference) = output.from.as_deref().and_then(param_name) else {
            continue;
        };
        if let Some(found) = scope.artifacts.get(reference) {
            let mut artifact = found.clone();
            artifact.name = name.clone();
            artifact.from = Some(reference.to_string());
            outputs.upsert_artifact(artifact);
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{DisabledOffloadRepo, InMemoryOffloadRepo};
    use crate::repository::InMemoryConfigMaps;
    use crate::template::types::{InputArtifact, OutputArtifact};
    use crate::template::{BaseTemplate, EmbeddedFixture, TemplateType};
    use crate::objects::ObjectMeta;
    use crate::workflow::pod::mux_termination_message;
    use crate::workflow::runtime::{InMemoryPodRuntime, PodObservation};
    use crate::workflow::WorkflowSpec;

    fn repository() -> ArtifactRepository {
        ArtifactRepository {
            archive_logs: false,
            key_format: None,
            location: ArtifactLocation::S3 {
                bucket: "artifacts".into(),
                key: String::new(),
                endpoint: None,
                region: None,
            },
        }
    }

    fn operator(
        runtime: Arc<InMemoryPodRuntime>,
        offloads: Arc<dyn OffloadNodeStatusRepo>,
        config: WorkflowConfig,
    ) -> WorkflowOperator {
        let resolver = RepositoryResolver::new(
            Arc::new(InMemoryConfigMaps::new()),
            "flowmill",
            Some(repository()),
        );
        WorkflowOperator::new(
            runtime,
            offloads,
            Arc::new(resolver),
            EventPublisher::new(64),
            config,
        )
    }

    fn container(name: &str) -> ContainerTemplate {
        ContainerTemplate {
            base: BaseTemplate::new(TemplateType::Container, name),
            image: "alpine:3.20".into(),
            command: vec!["sh".into(), "-c".into(), "true".into()],
            ..Default::default()
        }
    }

    fn step(template: ContainerTemplate) -> EmbeddedStep {
        EmbeddedStep {
            template: Some(Box::new(EmbeddedTemplate::Container(template))),
            ..Default::default()
        }
    }

    fn steps_workflow(name: &str, groups: Vec<Vec<(&str, EmbeddedStep)>>) -> Workflow {
        let template = EmbeddedWorkflow {
            base: BaseTemplate::new(TemplateType::Workflow, "pipeline"),
            steps: groups
                .into_iter()
                .map(|group| {
                    group
                        .into_iter()
                        .map(|(n, s)| (n.to_string(), s))
                        .collect()
                })
                .collect(),
            ..Default::default()
        };
        let mut metadata = ObjectMeta::named("ci", name);
        metadata.generation = 1;
        Workflow::new(metadata, WorkflowSpec::new(EmbeddedTemplate::Workflow(template)))
    }

    fn pod_of(workflow: &Workflow, node_name: &str) -> String {
        workflow
            .node_by_name(node_name)
            .and_then(|n| n.pod_name.clone())
            .unwrap()
    }

    fn finish_pod(runtime: &InMemoryPodRuntime, workflow: &Workflow, node_name: &str, outputs: Option<NodeIo>) {
        let mut observation = PodObservation::new(PodPhase::Succeeded);
        if let Some(outputs) = outputs {
            observation =
                observation.with_termination_message(mux_termination_message("done", &outputs).unwrap());
        }
        assert!(runtime.set_observation("ci", &pod_of(workflow, node_name), observation));
    }

    #[tokio::test]
    async fn test_artifact_flows_between_sequential_steps() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());

        let mut build = container("build");
        build.outputs.artifacts.insert(
            "bin".into(),
            OutputArtifact {
                path: Some("/out/bin".into()),
                ..Default::default()
            },
        );
        let mut test = container("test");
        test.inputs.artifacts.insert(
            "bin".into(),
            InputArtifact {
                path: Some("/in/bin".into()),
                ..Default::default()
            },
        );
        let mut test_step = step(test);
        test_step.arguments.insert(
            "artifacts.bin".into(),
            "%%steps.build.outputs.artifacts.bin%%".into(),
        );
        let mut wf = steps_workflow("release", vec![vec![("build", step(build))], vec![("test", test_step)]]);

        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Running);
        assert!(outcome.requeue);
        assert_eq!(runtime.len(), 1);

        finish_pod(&runtime, &wf, "release[0].build(0)", None);
        op.operate(&mut wf).await.unwrap();
        assert_eq!(
            wf.node_by_name("release[0].build").unwrap().phase,
            NodePhase::Succeeded
        );
        assert_eq!(runtime.len(), 2);

        let test_pod = runtime.pod("ci", &pod_of(&wf, "release[1].test(0)")).unwrap();
        let downloads = test_pod.downloads();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].path, "/in/bin");
        assert_eq!(
            downloads[0].from.as_deref(),
            Some("steps.build.outputs.artifacts.bin")
        );
        let built = wf
            .node_by_name("release[0].build")
            .unwrap()
            .outputs
            .as_ref()
            .unwrap()
            .artifact("bin")
            .unwrap()
            .clone();
        assert_eq!(downloads[0].artifact.location, built.location);

        finish_pod(&runtime, &wf, "release[1].test(0)", None);
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
        assert!(!outcome.requeue);
        assert!(wf.status.finished_at.is_some());
        assert_eq!(wf.status.observed_generation, 1);
    }

    /// One step group served by a `db` dynamic fixture
    fn with_database(name: &str) -> Workflow {
        let mut wf = steps_workflow(name, vec![vec![("test", step(container("test")))]]);
        if let EmbeddedTemplate::Workflow(template) = &mut wf.spec.template {
            template.fixtures = vec![BTreeMap::from([(
                "db".to_string(),
                EmbeddedFixture {
                    template: Some(Box::new(EmbeddedTemplate::Container(container("postgres")))),
                    ..Default::default()
                },
            )])];
        }
        wf
    }

    async fn launch_database(runtime: &InMemoryPodRuntime, op: &WorkflowOperator, wf: &mut Workflow) -> String {
        op.operate(wf).await.unwrap();
        assert_eq!(runtime.len(), 1);
        assert!(wf.node_by_name(&format!("{}[0].test", wf.name())).is_none());

        let fixture_pod = pod_of(wf, &format!("{}.fixtures[0].db(0)", wf.name()));
        runtime.set_observation("ci", &fixture_pod, PodObservation::new(PodPhase::Running));
        op.operate(wf).await.unwrap();
        assert_eq!(runtime.len(), 2);
        assert_eq!(
            wf.node_by_name(&format!("{}.fixtures", wf.name())).unwrap().phase,
            NodePhase::Succeeded
        );
        fixture_pod
    }

    #[tokio::test]
    async fn test_running_fixture_released_after_steps_succeed() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = with_database("integration");
        let fixture_pod = launch_database(&runtime, &op, &mut wf).await;

        // a pass while the step runs leaves the fixture up
        op.operate(&mut wf).await.unwrap();
        assert!(runtime.pod("ci", &fixture_pod).is_some());

        finish_pod(&runtime, &wf, "integration[0].test(0)", None);
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
        assert!(runtime.pod("ci", &fixture_pod).is_none());
        assert_eq!(runtime.len(), 1);
        let attempt = wf.node_by_name("integration.fixtures[0].db(0)").unwrap();
        assert_eq!(attempt.phase, NodePhase::Succeeded);
        assert_eq!(attempt.message.as_deref(), Some(FIXTURE_RELEASED));
    }

    #[tokio::test]
    async fn test_running_fixture_released_when_step_fails() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = with_database("flaky-db");
        let fixture_pod = launch_database(&runtime, &op, &mut wf).await;

        runtime.set_observation(
            "ci",
            &pod_of(&wf, "flaky-db[0].test(0)"),
            PodObservation::new(PodPhase::Failed).with_message("assertion failed"),
        );
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Failed);
        assert!(runtime.pod("ci", &fixture_pod).is_none());
        assert_eq!(
            wf.node_by_name("flaky-db.fixtures[0].db").unwrap().phase,
            NodePhase::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failed_fixture_is_cleaned_up_without_running_steps() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = with_database("no-db");

        op.operate(&mut wf).await.unwrap();
        let fixture_pod = pod_of(&wf, "no-db.fixtures[0].db(0)");
        runtime.set_observation(
            "ci",
            &fixture_pod,
            PodObservation::new(PodPhase::Failed).with_message("image pull failed"),
        );
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Failed);
        assert!(runtime.is_empty());
        assert!(wf.node_by_name("no-db[0].test").is_none());
    }

    #[tokio::test]
    async fn test_parallel_group_waits_for_every_step() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow(
            "fanout",
            vec![vec![("a", step(container("a"))), ("b", step(container("b")))]],
        );

        op.operate(&mut wf).await.unwrap();
        assert_eq!(runtime.len(), 2);

        let mut reported = NodeIo::default();
        reported.parameters.insert("digest".into(), "abc".into());
        finish_pod(&runtime, &wf, "fanout[0].a(0)", Some(reported));
        op.operate(&mut wf).await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Running);
        assert_eq!(
            wf.node_by_name("fanout[0].a").unwrap().outputs.as_ref().unwrap().parameters["digest"],
            "abc"
        );

        finish_pod(&runtime, &wf, "fanout[0].b(0)", None);
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
        let group = wf.node_by_name("fanout[0]").unwrap();
        assert_eq!(group.children.len(), 2);
        assert_eq!(group.outbound, group.children);
    }

    #[tokio::test]
    async fn test_evicted_pod_gets_a_retry_attempt() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow("flaky", vec![vec![("run", step(container("run")))]]);

        op.operate(&mut wf).await.unwrap();
        runtime.set_observation(
            "ci",
            &pod_of(&wf, "flaky[0].run(0)"),
            PodObservation::new(PodPhase::Failed).with_reason("Evicted"),
        );
        op.operate(&mut wf).await.unwrap();

        assert_eq!(wf.node_by_name("flaky[0].run(0)").unwrap().phase, NodePhase::Error);
        assert_eq!(wf.node_by_name("flaky[0].run(1)").unwrap().phase, NodePhase::Running);
        assert_eq!(wf.node_by_name("flaky[0].run").unwrap().children.len(), 2);
        assert_eq!(runtime.len(), 2);

        finish_pod(&runtime, &wf, "flaky[0].run(1)", None);
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_step_skips_later_groups_except_always_run() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut cleanup = step(container("cleanup"));
        cleanup.flags = "always_run".into();
        let mut wf = steps_workflow(
            "broken",
            vec![
                vec![("compile", step(container("compile")))],
                vec![("publish", step(container("publish")))],
                vec![("cleanup", cleanup)],
            ],
        );

        op.operate(&mut wf).await.unwrap();
        runtime.set_observation(
            "ci",
            &pod_of(&wf, "broken[0].compile(0)"),
            PodObservation::new(PodPhase::Failed).with_message("exit code 2"),
        );
        op.operate(&mut wf).await.unwrap();
        assert!(wf.node_by_name("broken[1].publish").is_none());
        assert_eq!(
            wf.node_by_name("broken[2].cleanup(0)").unwrap().phase,
            NodePhase::Running
        );

        finish_pod(&runtime, &wf, "broken[2].cleanup(0)", None);
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Failed);
        assert_eq!(
            wf.node_by_name("broken[0].compile").unwrap().message.as_deref(),
            Some("exit code 2")
        );
    }

    #[tokio::test]
    async fn test_ignored_failure_does_not_fail_the_workflow() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut lint = step(container("lint"));
        lint.flags = "ignore_error".into();
        let mut wf = steps_workflow("lenient", vec![vec![("lint", lint)]]);

        op.operate(&mut wf).await.unwrap();
        runtime.set_observation(
            "ci",
            &pod_of(&wf, "lenient[0].lint(0)"),
            PodObservation::new(PodPhase::Failed),
        );
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
        let lint = wf.node_by_name("lenient[0].lint").unwrap();
        assert_eq!(lint.phase, NodePhase::Failed);
        assert!(lint.ignored);
    }

    #[tokio::test]
    async fn test_quota_rejection_holds_new_pods() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        runtime.fail_next_creates([RuntimeError::Quota {
            message: "exceeded quota: pods".into(),
        }]);
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow("busy", vec![vec![("run", step(container("run")))]]);

        let outcome = op.operate(&mut wf).await.unwrap();
        assert!(outcome.backoff);
        assert_eq!(runtime.len(), 0);
        assert_eq!(wf.node_by_name("busy[0].run(0)").unwrap().phase, NodePhase::Error);
        assert_eq!(wf.node_by_name("busy[0].run(1)").unwrap().phase, NodePhase::Pending);

        let outcome = op.operate(&mut wf).await.unwrap();
        assert!(!outcome.backoff);
        assert_eq!(runtime.len(), 1);
        assert_eq!(wf.node_by_name("busy[0].run(1)").unwrap().phase, NodePhase::Running);
    }

    #[tokio::test]
    async fn test_terminate_stops_running_pods() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow(
            "long",
            vec![
                vec![("sleep", step(container("sleep")))],
                vec![("after", step(container("after")))],
            ],
        );
        op.operate(&mut wf).await.unwrap();

        wf.spec.terminate = true;
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Failed);
        assert_eq!(wf.status.message.as_deref(), Some(TERMINATED_MESSAGE));
        let pod = runtime.pod("ci", &pod_of(&wf, "long[0].sleep(0)")).unwrap();
        assert_eq!(pod.active_deadline_seconds, Some(0));
        assert!(wf.node_by_name("long[1].after").is_none());
    }

    #[tokio::test]
    async fn test_time_limit_fails_with_terminal_status() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow("slow", vec![vec![("run", step(container("run")))]]);
        if let EmbeddedTemplate::Workflow(template) = &mut wf.spec.template {
            template.termination_policy = Some(crate::template::TerminationPolicy {
                spending_cents: None,
                time_seconds: Some("60".into()),
            });
        }

        op.operate(&mut wf).await.unwrap();
        wf.status.started_at = Some(Utc::now() - chrono::Duration::seconds(120));
        let outcome = op.operate(&mut wf).await.unwrap();

        assert_eq!(outcome.phase, WorkflowPhase::Failed);
        let terminal = wf.status.terminal.as_ref().unwrap();
        assert_eq!(terminal.code, StatusCode::LimitTimeExceeded);
    }

    #[tokio::test]
    async fn test_large_node_status_is_offloaded() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let offloads = Arc::new(InMemoryOffloadRepo::default());
        let config = WorkflowConfig {
            offload_threshold_bytes: 64,
            ..WorkflowConfig::default()
        };
        let op = operator(runtime.clone(), offloads.clone(), config);
        let mut wf = steps_workflow("big", vec![vec![("run", step(container("run")))]]);

        op.operate(&mut wf).await.unwrap();
        assert!(wf.status.nodes.is_empty());
        assert!(wf.status.is_offloaded());
        assert_eq!(offloads.len(), 1);

        finish_pod_offloaded(&runtime, &offloads, &wf).await;
        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Succeeded);
    }

    async fn finish_pod_offloaded(
        runtime: &InMemoryPodRuntime,
        offloads: &InMemoryOffloadRepo,
        wf: &Workflow,
    ) {
        let version = wf.status.offload_node_status_version.clone().unwrap();
        let nodes = offloads.get(wf.uid(), &version).await.unwrap();
        let pod = nodes
            .get(&node_id(wf.uid(), "big[0].run(0)"))
            .and_then(|n| n.pod_name.clone())
            .unwrap();
        runtime.set_observation("ci", &pod, PodObservation::new(PodPhase::Succeeded));
    }

    #[tokio::test]
    async fn test_too_large_without_offloading_errors_the_workflow() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let config = WorkflowConfig {
            offload_threshold_bytes: 16,
            ..WorkflowConfig::default()
        };
        let op = operator(runtime, Arc::new(DisabledOffloadRepo), config);
        let mut wf = steps_workflow("huge", vec![vec![("run", step(container("run")))]]);

        let outcome = op.operate(&mut wf).await.unwrap();
        assert_eq!(outcome.phase, WorkflowPhase::Error);
        assert!(wf.status.message.as_deref().unwrap().contains("offloading is disabled"));
    }

    #[tokio::test]
    async fn test_literal_input_uri_is_downloaded() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut consumer = container("consumer");
        consumer.inputs.artifacts.insert(
            "data".into(),
            InputArtifact {
                path: Some("/in/data".into()),
                ..Default::default()
            },
        );
        let mut wf = Workflow::new(
            ObjectMeta::named("ci", "orphan"),
            WorkflowSpec::new(EmbeddedTemplate::Container(consumer)),
        );
        wf.spec
            .arguments
            .insert("artifacts.data".into(), "s3://bucket/data.tgz".into());
        op.operate(&mut wf).await.unwrap();
        let node = wf.node_by_name("orphan(0)").unwrap();
        assert_eq!(
            node.inputs.as_ref().unwrap().artifacts[0].key(),
            "data.tgz"
        );
        assert_eq!(runtime.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_keeps_successful_nodes() {
        let runtime = Arc::new(InMemoryPodRuntime::new());
        let op = operator(runtime.clone(), Arc::new(DisabledOffloadRepo), WorkflowConfig::default());
        let mut wf = steps_workflow(
            "again",
            vec![vec![("ok", step(container("ok")))], vec![("bad", step(container("bad")))]],
        );

        op.operate(&mut wf).await.unwrap();
        finish_pod(&runtime, &wf, "again[0].ok(0)", None);
        op.operate(&mut wf).await.unwrap();
        runtime.set_observation(
            "ci",
            &pod_of(&wf, "again[1].bad(0)"),
            PodObservation::new(PodPhase::Failed),
        );
        assert_eq!(op.operate(&mut wf).await.unwrap().phase, WorkflowPhase::Failed);

        let first_bad_pod = pod_of(&wf, "again[1].bad(0)");
        op.retry(&mut wf).await.unwrap();
        assert_eq!(wf.status.phase, WorkflowPhase::Running);
        assert_eq!(wf.metadata.generation, 2);
        assert!(wf.node_by_name("again[0].ok").is_some());
        assert!(wf.node_by_name("again[1].bad").is_none());
        assert!(wf.node_by_name("again").is_none());

        op.operate(&mut wf).await.unwrap();
        assert_ne!(pod_of(&wf, "again[1].bad(0)"), first_bad_pod);
        assert_eq!(runtime.len(), 3);

        let err = op.retry(&mut wf).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotCompleted { .. }));
    }
}
