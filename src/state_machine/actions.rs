use async_trait::async_trait;
use serde_json::json;

use super::errors::{StateMachineError, StateMachineResult};
use crate::constants::events;
use crate::events::publisher::EventPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Node,
    Deployment,
}

impl Entity {
    pub fn as_str(self) -> &'static str {
        match self {
            Entity::Node => "node",
            Entity::Deployment => "deployment",
        }
    }

    fn changed_event(self) -> &'static str {
        match self {
            Entity::Node => events::NODE_PHASE_CHANGED,
            Entity::Deployment => events::DEPLOYMENT_STATE_CHANGED,
        }
    }
}

/// A node phase or deployment state change that already happened
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<'a> {
    pub entity: Entity,
    /// Node id, or `namespace/name` for deployments
    pub key: &'a str,
    pub from: String,
    pub to: String,
    pub event: &'a str,
    pub message: Option<&'a str>,
}

impl Transition<'_> {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }
}

/// Side effect run after a transition has been applied
#[async_trait]
pub trait StateAction: Send + Sync {
    async fn execute(&self, transition: &Transition<'_>) -> StateMachineResult<()>;

    fn description(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct PublishTransitionEventAction {
    publisher: EventPublisher,
}

impl PublishTransitionEventAction {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl StateAction for PublishTransitionEventAction {
    async fn execute(&self, transition: &Transition<'_>) -> StateMachineResult<()> {
        if !transition.is_change() {
            return Ok(());
        }
        let name = transition.entity.changed_event();
        let context = json!({
            "entity": transition.entity.as_str(),
            "key": transition.key,
            "from": transition.from,
            "to": transition.to,
            "event": transition.event,
            "message": transition.message,
        });
        self.publisher
            .publish(name, context)
            .await
            .map(|_| ())
            .map_err(|e| StateMachineError::Internal(format!("{name}: {e}")))
    }

    fn description(&self) -> &'static str {
        "publish state change"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_real_changes_are_published() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        let action = PublishTransitionEventAction::new(publisher);

        let unchanged = Transition {
            entity: Entity::Deployment,
            key: "app/web",
            from: "Active".into(),
            to: "Active".into(),
            event: "heartbeat",
            message: None,
        };
        action.execute(&unchanged).await.unwrap();
        assert!(rx.try_recv().is_err());

        let degraded = Transition {
            to: "Error".into(),
            message: Some("1 of 2 available"),
            ..unchanged
        };
        action.execute(&degraded).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, events::DEPLOYMENT_STATE_CHANGED);
        assert_eq!(event.context["to"], "Error");
        assert_eq!(event.context["message"], "1 of 2 available");
    }

    #[tokio::test]
    async fn test_node_changes_use_node_event() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        PublishTransitionEventAction::new(publisher)
            .execute(&Transition {
                entity: Entity::Node,
                key: "wf-1234",
                from: "Pending".into(),
                to: "Running".into(),
                event: "start",
                message: None,
            })
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, events::NODE_PHASE_CHANGED);
        assert_eq!(event.context["entity"], "node");
    }
}
