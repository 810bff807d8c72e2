use super::actions::{Entity, PublishTransitionEventAction, StateAction, Transition};
use super::errors::{StateMachineError, StateMachineResult};
use super::states::DeploymentState;
use crate::events::publisher::EventPublisher;
use crate::logging::log_deployment_operation;

/// Deployment lifecycle governed by the fixed transition table
#[derive(Debug, Clone)]
pub struct DeploymentStateMachine {
    key: String,
    state: DeploymentState,
    event_publisher: EventPublisher,
}

impl DeploymentStateMachine {
    pub fn new(key: impl Into<String>, state: DeploymentState, event_publisher: EventPublisher) -> Self {
        Self {
            key: key.into(),
            state,
            event_publisher,
        }
    }

    pub fn current_state(&self) -> DeploymentState {
        self.state
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check a transition against the table without applying it
    pub fn check(&self, to: DeploymentState) -> StateMachineResult<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(StateMachineError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Move to `to`, then run post-transition actions
    pub async fn transition(
        &mut self,
        to: DeploymentState,
        message: Option<&str>,
    ) -> StateMachineResult<DeploymentState> {
        self.check(to)?;
        let from = self.state;
        self.state = to;

        log_deployment_operation("transition", &self.key, &to.to_string(), message);
        let transition = Transition {
            entity: Entity::Deployment,
            key: &self.key,
            from: from.to_string(),
            to: to.to_string(),
            event: "transition",
            message,
        };
        self.execute_actions(&transition).await?;
        Ok(from)
    }

    async fn execute_actions(&self, transition: &Transition<'_>) -> StateMachineResult<()> {
        let actions: Vec<Box<dyn StateAction>> = vec![Box::new(
            PublishTransitionEventAction::new(self.event_publisher.clone()),
        )];
        for action in actions {
            action.execute(transition).await?;
        }
        Ok(())
    }
}
