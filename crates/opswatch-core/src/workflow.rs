//! Workflow lifecycle states for AI proposals.
//!
//! The exact string values are part of the external contract: collaborators
//! filter on them verbatim. Transitions form a one-way graph toward a
//! terminal state; [`WorkflowState::can_transition`] encodes the legal edges.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one AI workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Initial state
    Pending,
    /// Agent decision phase in progress
    Running,
    /// A tool proposal was obtained from the agent
    ProposalObtained,
    /// Policy validation passed
    PolicyApproved,
    /// Policy validation rejected the proposal
    PolicyRejected,
    /// Human approval is required
    ApprovalRequired,
    /// Waiting for the external approval signal
    AwaitingApproval,
    /// Approval arrived
    ApprovalComplete,
    /// Approval was rejected (or timed out)
    ApprovalRejected,
    /// Approval was not required and was skipped
    ApprovalSkipped,
    /// Tool capabilities were discovered
    CapabilityDiscoveryComplete,
    /// Tool execution failed
    ExecutionFailed,
    /// Execution results were processed
    ResultsProcessed,
    /// A recoverable failure was handled
    ErrorHandled,
    /// Workflow finished successfully
    Completed,
    /// Another iteration is authorized
    Continuing,
    /// Workflow finished unsuccessfully
    Failed,
    /// An approval flow was resolved out-of-band
    ApprovalResolved,
}

/// Category of a workflow state, for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStateCategory {
    /// The initial state
    Initial,
    /// A processing state
    Processing,
    /// A state that ends the run
    Terminal,
    /// A state reached through an error
    Error,
}

impl WorkflowState {
    /// Stable string value, as exposed to collaborators.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::ProposalObtained => "PROPOSAL_OBTAINED",
            Self::PolicyApproved => "POLICY_APPROVED",
            Self::PolicyRejected => "POLICY_REJECTED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::ApprovalComplete => "APPROVAL_COMPLETE",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
            Self::ApprovalSkipped => "APPROVAL_SKIPPED",
            Self::CapabilityDiscoveryComplete => "CAPABILITY_DISCOVERY_COMPLETE",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ResultsProcessed => "RESULTS_PROCESSED",
            Self::ErrorHandled => "ERROR_HANDLED",
            Self::Completed => "COMPLETED",
            Self::Continuing => "CONTINUING",
            Self::Failed => "FAILED",
            Self::ApprovalResolved => "APPROVAL_RESOLVED",
        }
    }

    /// Category this state belongs to.
    pub fn category(&self) -> WorkflowStateCategory {
        match self {
            Self::Pending => WorkflowStateCategory::Initial,
            Self::PolicyRejected
            | Self::ApprovalRejected
            | Self::ExecutionFailed
            | Self::ErrorHandled => WorkflowStateCategory::Error,
            Self::Completed | Self::Failed | Self::ApprovalResolved => {
                WorkflowStateCategory::Terminal
            }
            _ => WorkflowStateCategory::Processing,
        }
    }

    /// States that end a workflow run.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::ApprovalResolved
                | Self::ResultsProcessed
                | Self::PolicyRejected
                | Self::ErrorHandled
        )
    }

    /// States that authorize another iteration of the loop.
    pub fn is_continuing(&self) -> bool {
        matches!(self, Self::Continuing | Self::Running)
    }

    /// States reached through an error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejected | Self::ApprovalRejected | Self::ExecutionFailed | Self::Failed
        )
    }

    /// Whether the run stops in this state. `ResultsProcessed`,
    /// `PolicyRejected`, and `ErrorHandled` are completion states the driver
    /// still maps to a final `Completed`/`Failed`, so the hard stops are the
    /// three below.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::ApprovalResolved)
    }

    /// Whether the transition `self → to` follows a legal edge of the
    /// workflow graph.
    pub fn can_transition(&self, to: WorkflowState) -> bool {
        use WorkflowState as S;
        if self.is_terminal() {
            return false;
        }
        match self {
            S::Pending => matches!(to, S::Running),
            S::Running => matches!(to, S::ProposalObtained | S::ExecutionFailed | S::Failed),
            S::ProposalObtained => matches!(to, S::PolicyApproved | S::PolicyRejected),
            S::PolicyApproved => matches!(to, S::ApprovalRequired | S::ApprovalSkipped),
            S::PolicyRejected => matches!(to, S::Failed),
            S::ApprovalRequired => matches!(to, S::AwaitingApproval),
            S::AwaitingApproval => {
                matches!(to, S::ApprovalComplete | S::ApprovalRejected | S::ApprovalResolved)
            }
            // Discovery runs next and may itself fail.
            S::ApprovalComplete | S::ApprovalSkipped => {
                matches!(to, S::CapabilityDiscoveryComplete | S::ExecutionFailed)
            }
            S::ApprovalRejected => matches!(to, S::Failed),
            S::CapabilityDiscoveryComplete => {
                matches!(to, S::ResultsProcessed | S::ExecutionFailed)
            }
            S::ExecutionFailed => matches!(to, S::ErrorHandled | S::Failed),
            S::ErrorHandled => matches!(to, S::Running | S::Failed),
            S::ResultsProcessed => matches!(to, S::Completed | S::Continuing),
            S::Continuing => matches!(to, S::Running),
            S::Completed | S::Failed | S::ApprovalResolved => false,
        }
    }
}
