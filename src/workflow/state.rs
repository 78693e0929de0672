use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-issue workflow position. `Completed` and `Failed` are terminal;
/// `WaitingForClarification` is the only suspension point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Received,
    AnalyzingRequirements,
    WaitingForClarification,
    RequirementsClarified,
    CreatingTests,
    Implementing,
    CreatingDelivery,
    Completed { delivery_id: String },
    Failed { reason: String },
}

impl WorkflowState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::WaitingForClarification)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::AnalyzingRequirements => "analyzing_requirements",
            Self::WaitingForClarification => "waiting_for_clarification",
            Self::RequirementsClarified => "requirements_clarified",
            Self::CreatingTests => "creating_tests",
            Self::Implementing => "implementing",
            Self::CreatingDelivery => "creating_delivery",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { delivery_id } => write!(f, "completed ({delivery_id})"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

/// The observed result of the last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// Unconditional moves out of `Received` and `RequirementsClarified`.
    Proceed,
    AnalysisSucceeded,
    ClarificationNeeded,
    AnalysisFailed { reason: String },
    HumanReplied,
    TestsCreated,
    TestsFailed { reason: String },
    ImplementationSucceeded,
    ImplementationFailed { reason: String },
    DeliveryAccepted { delivery_id: String },
    DeliveryRejected { reason: String },
    /// A collaborator read or write failed after retries.
    ExternalFailure { reason: String },
    Cancelled,
}

impl StepEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::AnalysisSucceeded => "analysis_succeeded",
            Self::ClarificationNeeded => "clarification_needed",
            Self::AnalysisFailed { .. } => "analysis_failed",
            Self::HumanReplied => "human_replied",
            Self::TestsCreated => "tests_created",
            Self::TestsFailed { .. } => "tests_failed",
            Self::ImplementationSucceeded => "implementation_succeeded",
            Self::ImplementationFailed { .. } => "implementation_failed",
            Self::DeliveryAccepted { .. } => "delivery_accepted",
            Self::DeliveryRejected { .. } => "delivery_rejected",
            Self::ExternalFailure { .. } => "external_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("event {event} is not valid in state {state}")]
pub struct TransitionError {
    pub state: &'static str,
    pub event: &'static str,
}

pub const CANCELLED_REASON: &str = "cancelled";

/// The exhaustive transition table.
pub fn transition(state: &WorkflowState, event: StepEvent) -> Result<WorkflowState, TransitionError> {
    use StepEvent as E;
    use WorkflowState as S;

    let next = match (state, event) {
        (S::Completed { .. } | S::Failed { .. }, e) => {
            return Err(TransitionError {
                state: state.name(),
                event: e.name(),
            });
        }
        (_, E::Cancelled) => S::Failed {
            reason: CANCELLED_REASON.to_string(),
        },
        (_, E::ExternalFailure { reason }) => S::Failed { reason },

        (S::Received, E::Proceed) => S::AnalyzingRequirements,

        (S::AnalyzingRequirements, E::AnalysisSucceeded) => S::RequirementsClarified,
        (S::AnalyzingRequirements, E::ClarificationNeeded) => S::WaitingForClarification,
        (S::AnalyzingRequirements, E::AnalysisFailed { reason }) => S::Failed { reason },

        (S::WaitingForClarification, E::HumanReplied) => S::AnalyzingRequirements,

        (S::RequirementsClarified, E::Proceed) => S::CreatingTests,

        (S::CreatingTests, E::TestsCreated) => S::Implementing,
        (S::CreatingTests, E::TestsFailed { reason }) => S::Failed { reason },

        (S::Implementing, E::ImplementationSucceeded) => S::CreatingDelivery,
        (S::Implementing, E::ImplementationFailed { reason }) => S::Failed { reason },

        (S::CreatingDelivery, E::DeliveryAccepted { delivery_id }) => S::Completed { delivery_id },
        (S::CreatingDelivery, E::DeliveryRejected { reason }) => S::Failed { reason },

        (
            S::Received
            | S::AnalyzingRequirements
            | S::WaitingForClarification
            | S::RequirementsClarified
            | S::CreatingTests
            | S::Implementing
            | S::CreatingDelivery,
            e,
        ) => {
            return Err(TransitionError {
                state: state.name(),
                event: e.name(),
            });
        }
    };
    Ok(next)
}
