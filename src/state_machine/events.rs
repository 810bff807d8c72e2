use serde::{Deserialize, Serialize};

/// Events that move a node through its phases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NodeEvent {
    /// Pod or agent task was created
    Start,
    /// Execution finished successfully
    Succeed,
    /// Execution failed for a reason a retry will not fix
    Fail(String),
    /// Infrastructure failure; eligible for a retry sibling
    Error(String),
    /// Step is not executed
    Skip,
    /// Put a completed node back to pending for a workflow retry
    Reset,
}

impl NodeEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Error(_) => "error",
            Self::Skip => "skip",
            Self::Reset => "reset",
        }
    }

    /// Extract the message carried by failure events
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) | Self::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_message() {
        let event = NodeEvent::Error("pod evicted".to_string());
        assert_eq!(event.event_type(), "error");
        assert_eq!(event.message(), Some("pod evicted"));
        assert_eq!(NodeEvent::Start.message(), None);
    }

    #[test]
    fn test_event_serde() {
        let json = serde_json::to_string(&NodeEvent::Fail("exit 1".into())).unwrap();
        assert_eq!(json, r#"{"type":"Fail","data":"exit 1"}"#);
        let parsed: NodeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, NodeEvent::Fail("exit 1".into()));
    }
}
