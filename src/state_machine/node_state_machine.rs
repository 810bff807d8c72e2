use chrono::Utc;

use super::errors::{StateMachineError, StateMachineResult};
use super::events::NodeEvent;
use super::states::NodePhase;
use crate::workflow::NodeStatus;

/// Phase transitions of a single node.
///
/// ```text
/// Pending ──Start──▶ Running ──Succeed──▶ Succeeded
///    │                  ├──Fail────▶ Failed
///    ├──Skip──▶ Skipped └──Error───▶ Error
///    └──Fail/Error──▶ Failed/Error
/// ```
///
/// Any completed phase goes back to `Pending` on `Reset`.
pub struct NodeStateMachine;

impl NodeStateMachine {
    /// Determine the target phase based on current phase and event
    pub fn determine_target_phase(
        current: NodePhase,
        event: &NodeEvent,
    ) -> StateMachineResult<NodePhase> {
        let target = match (current, event) {
            (NodePhase::Pending, NodeEvent::Start) => NodePhase::Running,
            (NodePhase::Running, NodeEvent::Start) => NodePhase::Running,

            (NodePhase::Running, NodeEvent::Succeed) => NodePhase::Succeeded,
            // agent tasks and parent nodes can complete without passing through Running
            (NodePhase::Pending, NodeEvent::Succeed) => NodePhase::Succeeded,

            (NodePhase::Pending | NodePhase::Running, NodeEvent::Fail(_)) => NodePhase::Failed,
            (NodePhase::Pending | NodePhase::Running, NodeEvent::Error(_)) => NodePhase::Error,

            (NodePhase::Pending, NodeEvent::Skip) => NodePhase::Skipped,

            (phase, NodeEvent::Reset) if phase.is_completed() => NodePhase::Pending,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };
        Ok(target)
    }

    /// Apply `event` to `node`, maintaining timestamps and the message.
    /// Returns the phase the node left.
    pub fn apply(node: &mut NodeStatus, event: &NodeEvent) -> StateMachineResult<NodePhase> {
        let from = node.phase;
        let to = Self::determine_target_phase(from, event)?;
        let now = Utc::now();

        match to {
            NodePhase::Running => {
                node.started_at.get_or_insert(now);
            }
            NodePhase::Pending => {
                node.started_at = None;
                node.finished_at = None;
                node.message = None;
                node.ignored = false;
            }
            _ => {
                node.started_at.get_or_insert(now);
                node.finished_at.get_or_insert(now);
            }
        }
        if let Some(message) = event.message() {
            node.message = Some(message.to_string());
        }
        node.phase = to;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            NodeStateMachine::determine_target_phase(NodePhase::Pending, &NodeEvent::Start)
                .unwrap(),
            NodePhase::Running
        );
        assert_eq!(
            NodeStateMachine::determine_target_phase(
                NodePhase::Running,
                &NodeEvent::Fail("exit 1".into())
            )
            .unwrap(),
            NodePhase::Failed
        );
        assert_eq!(
            NodeStateMachine::determine_target_phase(NodePhase::Failed, &NodeEvent::Reset)
                .unwrap(),
            NodePhase::Pending
        );
    }

    #[test]
    fn test_invalid_transitions() {
        // a completed node never re-enters running
        assert!(
            NodeStateMachine::determine_target_phase(NodePhase::Succeeded, &NodeEvent::Start)
                .is_err()
        );
        assert!(
            NodeStateMachine::determine_target_phase(NodePhase::Running, &NodeEvent::Skip).is_err()
        );
        assert!(
            NodeStateMachine::determine_target_phase(NodePhase::Running, &NodeEvent::Reset)
                .is_err()
        );
    }

    #[test]
    fn test_apply_sets_timestamps_and_message() {
        let mut node = NodeStatus::new("1", "wf[0].build", "build", NodePhase::Pending);
        NodeStateMachine::apply(&mut node, &NodeEvent::Start).unwrap();
        assert!(node.started_at.is_some());
        assert!(node.finished_at.is_none());

        let from = NodeStateMachine::apply(&mut node, &NodeEvent::Error("evicted".into())).unwrap();
        assert_eq!(from, NodePhase::Running);
        assert_eq!(node.phase, NodePhase::Error);
        assert!(node.finished_at.is_some());
        assert_eq!(node.message.as_deref(), Some("evicted"));

        NodeStateMachine::apply(&mut node, &NodeEvent::Reset).unwrap();
        assert_eq!(node.phase, NodePhase::Pending);
        assert!(node.finished_at.is_none());
        assert!(node.message.is_none());
    }
}
