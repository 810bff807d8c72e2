//! # Template Model
//!
//! Typed templates parsed from YAML, their validation, and the two transforms
//! that prepare a template for execution: embedding and argument substitution.
//!
//! ## Overview
//!
//! Templates come in six kinds: container, workflow, deployment, fixture,
//! policy and project. They reference each other by name and pass values
//! through `%%scope.name%%` parameters. A [`BuildContext`] holds the templates
//! of one repository branch and validates them together.
//!
//! ## Architecture
//!
//! - [`types`]: shared building blocks (inputs, outputs, references)
//! - [`params`]: parameter scoping and type checks
//! - [`container`], [`workflow`], [`deployment`], [`fixture`], [`policy`]: the kinds
//! - [`inline`]: inlined container slots and reverse-inlining
//! - [`context`]: parsing and dependency-ordered validation
//! - [`embed`]: self-contained templates for execution
//! - [`substitute`]: argument expansion into an embedded template

pub mod container;
pub mod context;
pub mod deployment;
pub mod document;
pub mod embed;
pub mod errors;
pub mod fixture;
pub mod inline;
pub mod params;
pub mod policy;
pub mod substitute;
pub mod types;
pub mod workflow;

pub use container::{ContainerResources, ContainerTemplate, EnvVar};
pub use context::{template_id, BuildContext};
pub use deployment::{DeploymentTemplate, RollingUpdate, Scale, Strategy, StrategyType};
pub use document::Template;
pub use embed::{EmbeddedDeployment, EmbeddedFixture, EmbeddedStep, EmbeddedTemplate, EmbeddedWorkflow};
pub use errors::{TemplateError, TemplateResult};
pub use fixture::FixtureTemplate;
pub use inline::InlineContainerTemplateRef;
pub use params::{ParamMap, ParamType};
pub use policy::{PolicyTemplate, ProjectTemplate};
pub use substitute::{substitute, FixtureAssignments};
pub use types::{
    Arguments, BaseTemplate, Inputs, Outputs, TemplateRef, TemplateType, TerminationPolicy,
    VolumeRequirement,
};
pub use workflow::{AgentExecutor, StepFlags, WorkflowStep, WorkflowTemplate};
