// State machines for workflow nodes and deployment instances.
//
// Node phases advance through a small event-driven machine; deployments move
// between states under a fixed transition table.

pub mod actions;
pub mod deployment_state_machine;
pub mod errors;
pub mod events;
pub mod node_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use deployment_state_machine::DeploymentStateMachine;
pub use errors::{StateMachineError, StateMachineResult};
pub use events::NodeEvent;
pub use node_state_machine::NodeStateMachine;
pub use states::{DeploymentState, NodePhase, WorkflowPhase, DEPLOYMENT_STATES, DEPLOYMENT_TRANSITIONS};

pub use actions::{Entity, PublishTransitionEventAction, StateAction, Transition};
