use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a single node in a workflow's node tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum NodePhase {
    /// Created but not started
    #[default]
    Pending,
    /// Pod (or agent task) is executing
    Running,
    /// Completed successfully
    Succeeded,
    /// Not executed because the step is flagged skipped or its group was cut short
    Skipped,
    /// Completed with a non-retryable failure
    Failed,
    /// Failed for infrastructure reasons; a retry sibling may replace it
    Error,
}

impl NodePhase {
    /// Check if this is a terminal phase (no further transitions except reset)
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Skipped | Self::Failed | Self::Error
        )
    }

    /// Check if the phase counts as success for step-group progress
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Skipped => write!(f, "Skipped"),
            Self::Failed => write!(f, "Failed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for NodePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Skipped" => Ok(Self::Skipped),
            "Failed" => Ok(Self::Failed),
            "Error" => Ok(Self::Error),
            _ => Err(format!("Invalid node phase: {s}")),
        }
    }
}

/// Phase of a whole workflow, derived from its entrypoint node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkflowPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }

    pub fn from_node(phase: NodePhase) -> Self {
        match phase {
            NodePhase::Pending => Self::Pending,
            NodePhase::Running => Self::Running,
            NodePhase::Succeeded | NodePhase::Skipped => Self::Succeeded,
            NodePhase::Failed => Self::Failed,
            NodePhase::Error => Self::Error,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Error" => Ok(Self::Error),
            _ => Err(format!("Invalid workflow phase: {s}")),
        }
    }
}

/// Lifecycle state of a deployment instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeploymentState {
    #[default]
    Init,
    Waiting,
    Active,
    Error,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Upgrading,
}

/// Row/column order of [`DEPLOYMENT_TRANSITIONS`]
pub const DEPLOYMENT_STATES: [DeploymentState; 9] = [
    DeploymentState::Init,
    DeploymentState::Waiting,
    DeploymentState::Active,
    DeploymentState::Error,
    DeploymentState::Stopping,
    DeploymentState::Stopped,
    DeploymentState::Terminating,
    DeploymentState::Terminated,
    DeploymentState::Upgrading,
];

/// `DEPLOYMENT_TRANSITIONS[from][to]`, indexed in [`DEPLOYMENT_STATES`] order
#[rustfmt::skip]
pub const DEPLOYMENT_TRANSITIONS: [[bool; 9]; 9] = {
    const O: bool = false;
    const I: bool = true;
    [
        // Init Wait Actv Err  Stpg Stpd Tmng Tmd  Upgr
        [I,   I,   O,   O,   O,   O,   O,   I,   O], // Init
        [O,   I,   I,   I,   I,   I,   I,   I,   O], // Waiting
        [O,   I,   I,   I,   I,   I,   I,   I,   I], // Active
        [O,   I,   I,   I,   I,   I,   I,   I,   I], // Error
        [O,   O,   O,   O,   I,   I,   I,   I,   O], // Stopping
        [O,   I,   O,   O,   O,   I,   I,   I,   I], // Stopped
        [O,   O,   O,   O,   O,   O,   I,   I,   O], // Terminating
        [O,   O,   O,   O,   O,   O,   O,   I,   O], // Terminated
        [O,   O,   I,   I,   I,   I,   I,   I,   I], // Upgrading
    ]
};

impl DeploymentState {
    fn index(self) -> usize {
        match self {
            Self::Init => 0,
            Self::Waiting => 1,
            Self::Active => 2,
            Self::Error => 3,
            Self::Stopping => 4,
            Self::Stopped => 5,
            Self::Terminating => 6,
            Self::Terminated => 7,
            Self::Upgrading => 8,
        }
    }

    pub fn can_transition_to(self, to: DeploymentState) -> bool {
        DEPLOYMENT_TRANSITIONS[self.index()][to.index()]
    }

    /// Scaling is refused from these states
    pub fn rejects_scale(self) -> bool {
        matches!(
            self,
            Self::Init | Self::Stopped | Self::Stopping | Self::Terminating | Self::Terminated
        )
    }

    /// States whose admission reservation is kept alive by the extender
    pub fn holds_reservation(self) -> bool {
        matches!(self, Self::Active | Self::Waiting | Self::Upgrading | Self::Error)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::Waiting => "Waiting",
            Self::Active => "Active",
            Self::Error => "Error",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Upgrading => "Upgrading",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DeploymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DEPLOYMENT_STATES
            .iter()
            .copied()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| format!("Invalid deployment state: {s}"))
    }
}
