//! The AI-proposal workflow state machine.
//!
//! One [`WorkflowRunner::run`] drives a single proposal from `PENDING` to a
//! terminal state, mediating policy review, the human approval gate,
//! capability discovery, and tool execution over MCP. Collaborators sit
//! behind traits so tests (and alternate deployments) swap them freely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use opswatch_client::{ProposalOutcome, ToolCatalog};
use opswatch_core::{AiAction, OpsError, OpsResult, WorkflowState};

use crate::prompt::PromptRegistry;

/// A concrete tool proposal produced from an [`AiAction`].
#[derive(Debug, Clone)]
pub struct ToolProposal {
    /// Tool to invoke
    pub tool_name: String,
    /// Tool arguments
    pub arguments: Value,
    /// Rendered prompt handed to the agent, when a template was set
    pub rendered_prompt: Option<String>,
    /// Whether the workflow should re-enter the loop after processing
    pub continue_run: bool,
}

/// Produces tool proposals for the agent decision phase.
#[async_trait]
pub trait ProposalSource: Send + Sync {
    /// Produce a proposal for the action's current iteration.
    async fn propose(&self, action: &AiAction, iteration: u32) -> OpsResult<ToolProposal>;
}

/// Default proposal source: renders the action's prompt template and reads
/// the tool call out of the action parameters (`tool_name`,
/// `tool_arguments`).
pub struct TemplateProposalSource {
    prompts: Arc<PromptRegistry>,
}

impl TemplateProposalSource {
    /// Create a source over a prompt registry.
    pub fn new(prompts: Arc<PromptRegistry>) -> Self {
        Self { prompts }
    }
}

#[async_trait]
impl ProposalSource for TemplateProposalSource {
    async fn propose(&self, action: &AiAction, _iteration: u32) -> OpsResult<ToolProposal> {
        let rendered_prompt = match &action.prompt_template_id {
            Some(template_id) => Some(self.prompts.render(template_id, &action.prompt_variables)?),
            None => None,
        };
        let tool_name = action
            .parameters
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or(&action.workflow_name)
            .to_string();
        let arguments = action
            .parameters
            .get("tool_arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        Ok(ToolProposal {
            tool_name,
            arguments,
            rendered_prompt,
            continue_run: false,
        })
    }
}

/// Policy verdict on a proposal.
#[derive(Debug, Clone)]
pub enum PolicyDecision {
    /// The proposal may proceed
    Approved,
    /// The proposal is rejected
    Rejected(String),
}

/// Reviews proposals before the approval gate.
#[async_trait]
pub trait PolicyGate: Send + Sync {
    /// Review a proposal.
    async fn review(&self, action: &AiAction, proposal: &ToolProposal) -> PolicyDecision;
}

/// Policy gate that approves everything.
#[derive(Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyGate for AllowAllPolicy {
    async fn review(&self, _action: &AiAction, _proposal: &ToolProposal) -> PolicyDecision {
        PolicyDecision::Approved
    }
}

/// External approval signal.
#[derive(Debug, Clone)]
pub enum ApprovalSignal {
    /// A human approved the run
    Approved {
        /// Who approved
        approver: String,
    },
    /// A human rejected the run
    Rejected {
        /// Why
        reason: String,
    },
}

/// Awaits the external approval signal for a run. The driver bounds the
/// wait with the action's `approval_timeout`.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Wait for the signal for `run_id`.
    async fn await_approval(&self, run_id: Uuid, action: &AiAction) -> ApprovalSignal;
}

/// Approval gate that grants immediately. Useful when approvals are
/// enforced upstream.
#[derive(Default)]
pub struct AutoApprovalGate;

#[async_trait]
impl ApprovalGate for AutoApprovalGate {
    async fn await_approval(&self, _run_id: Uuid, _action: &AiAction) -> ApprovalSignal {
        ApprovalSignal::Approved {
            approver: "auto".to_string(),
        }
    }
}

/// Approval gate resolved out-of-band: callers hold the gate and call
/// [`ChannelApprovalGate::resolve`] when the human decision arrives.
#[derive(Default)]
pub struct ChannelApprovalGate {
    waiting: SyncMutex<HashMap<Uuid, oneshot::Sender<ApprovalSignal>>>,
}

impl ChannelApprovalGate {
    /// New gate with no waiters.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver the decision for a waiting run. Returns false when the run
    /// is not waiting (already timed out or never asked).
    pub fn resolve(&self, run_id: Uuid, signal: ApprovalSignal) -> bool {
        match self.waiting.lock().remove(&run_id) {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    /// Run ids currently awaiting approval.
    pub fn pending(&self) -> Vec<Uuid> {
        self.waiting.lock().keys().copied().collect()
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn await_approval(&self, run_id: Uuid, _action: &AiAction) -> ApprovalSignal {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(run_id, tx);
        match rx.await {
            Ok(signal) => signal,
            // Sender dropped without a decision; treat as rejection.
            Err(_) => ApprovalSignal::Rejected {
                reason: "approval channel closed".to_string(),
            },
        }
    }
}

/// Executes proposed tools over MCP.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Discover the tool catalog. An empty catalog skips the known-tool
    /// check.
    async fn discover(&self) -> OpsResult<ToolCatalog>;

    /// Execute one tool, folding errors into the envelope.
    async fn execute(&self, tool_name: &str, arguments: Value) -> ProposalOutcome;
}

#[async_trait]
impl ToolExecutor for opswatch_client::Client {
    async fn discover(&self) -> OpsResult<ToolCatalog> {
        self.discover_tools().await
    }

    async fn execute(&self, tool_name: &str, arguments: Value) -> ProposalOutcome {
        self.execute_proposed_tool(tool_name, arguments).await
    }
}

/// [`ToolExecutor`] over a server pool, pinned to a preferred server.
pub struct ServerPoolExecutor {
    pool: Arc<opswatch_client::ServerPool>,
    preferred_server: String,
}

impl ServerPoolExecutor {
    /// Create an executor preferring the given server.
    pub fn new(pool: Arc<opswatch_client::ServerPool>, preferred_server: impl Into<String>) -> Self {
        Self {
            pool,
            preferred_server: preferred_server.into(),
        }
    }
}

#[async_trait]
impl ToolExecutor for ServerPoolExecutor {
    async fn discover(&self) -> OpsResult<ToolCatalog> {
        // The pool exposes execution, not enumeration; leave the catalog
        // empty so the runner skips the known-tool check.
        Ok(ToolCatalog::new())
    }

    async fn execute(&self, tool_name: &str, arguments: Value) -> ProposalOutcome {
        match self
            .pool
            .execute_tool_call(&self.preferred_server, tool_name, arguments)
            .await
        {
            Ok(data) => ProposalOutcome {
                success: true,
                data: Some(data),
                error: None,
                tool_used: tool_name.to_string(),
            },
            Err(err) => ProposalOutcome {
                success: false,
                data: None,
                error: Some(err.to_record()),
                tool_used: tool_name.to_string(),
            },
        }
    }
}

/// Final report of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Run identifier
    pub run_id: Uuid,
    /// Workflow that ran
    pub workflow_name: String,
    /// Whether the run ended in `COMPLETED`
    pub success: bool,
    /// Terminal state
    pub final_state: WorkflowState,
    /// Iterations performed (≥ 1)
    pub iterations: u32,
    /// Failure reason, empty on success
    pub reason: String,
    /// Every state visited, in order
    pub state_history: Vec<WorkflowState>,
    /// Result of the last tool execution, when one ran
    pub outcome: Option<ProposalOutcome>,
}

/// Drives AI proposals through their lifecycle.
pub struct WorkflowRunner {
    proposals: Arc<dyn ProposalSource>,
    policy: Arc<dyn PolicyGate>,
    approval: Arc<dyn ApprovalGate>,
    executor: Arc<dyn ToolExecutor>,
    /// Upper bound on `CONTINUING` iterations
    pub max_iterations: u32,
}

impl WorkflowRunner {
    /// Create a runner from its collaborators.
    pub fn new(
        proposals: Arc<dyn ProposalSource>,
        policy: Arc<dyn PolicyGate>,
        approval: Arc<dyn ApprovalGate>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            proposals,
            policy,
            approval,
            executor,
            max_iterations: 10,
        }
    }

    fn advance(history: &mut Vec<WorkflowState>, state: &mut WorkflowState, next: WorkflowState) {
        if !state.can_transition(next) {
            // A driver bug, not a runtime condition; make it loud.
            panic!("illegal workflow transition {:?} -> {:?}", state, next);
        }
        debug!(from = state.as_str(), to = next.as_str(), "workflow transition");
        *state = next;
        history.push(next);
    }

    /// Run one proposal to a terminal state.
    pub async fn run(&self, action: &AiAction) -> WorkflowResult {
        let run_id = Uuid::new_v4();
        let mut state = WorkflowState::Pending;
        let mut history = vec![state];
        let mut iterations: u32 = 0;
        let mut attempts_used: u32 = 0;
        let mut last_outcome: Option<ProposalOutcome> = None;

        info!(run_id = %run_id, workflow = %action.workflow_name, "workflow run started");

        let (final_state, reason) = 'run: loop {
            iterations += 1;
            Self::advance(&mut history, &mut state, WorkflowState::Running);

            // Agent decision phase.
            let proposal = match self.proposals.propose(action, iterations).await {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "proposal phase failed");
                    match self.handle_execution_failure(
                        &mut history,
                        &mut state,
                        &mut attempts_used,
                        action,
                        &e.to_string(),
                        e.is_retryable(),
                    ).await {
                        FailureVerdict::Retry => continue 'run,
                        FailureVerdict::GiveUp(reason) => break 'run (WorkflowState::Failed, reason),
                    }
                }
            };
            Self::advance(&mut history, &mut state, WorkflowState::ProposalObtained);

            // Policy validation phase.
            match self.policy.review(action, &proposal).await {
                PolicyDecision::Approved => {
                    Self::advance(&mut history, &mut state, WorkflowState::PolicyApproved);
                }
                PolicyDecision::Rejected(reason) => {
                    Self::advance(&mut history, &mut state, WorkflowState::PolicyRejected);
                    Self::advance(&mut history, &mut state, WorkflowState::Failed);
                    break 'run (WorkflowState::Failed, format!("policy_rejected: {reason}"));
                }
            }

            // Approval phase.
            if action.approval_required {
                Self::advance(&mut history, &mut state, WorkflowState::ApprovalRequired);
                Self::advance(&mut history, &mut state, WorkflowState::AwaitingApproval);
                let signal =
                    timeout(action.approval_timeout, self.approval.await_approval(run_id, action))
                        .await;
                match signal {
                    Ok(ApprovalSignal::Approved { approver }) => {
                        debug!(run_id = %run_id, approver = %approver, "approval granted");
                        Self::advance(&mut history, &mut state, WorkflowState::ApprovalComplete);
                    }
                    Ok(ApprovalSignal::Rejected { reason }) => {
                        Self::advance(&mut history, &mut state, WorkflowState::ApprovalRejected);
                        Self::advance(&mut history, &mut state, WorkflowState::Failed);
                        break 'run (WorkflowState::Failed, format!("approval_rejected: {reason}"));
                    }
                    Err(_) => {
                        Self::advance(&mut history, &mut state, WorkflowState::ApprovalRejected);
                        Self::advance(&mut history, &mut state, WorkflowState::Failed);
                        break 'run (WorkflowState::Failed, "approval_timeout".to_string());
                    }
                }
            } else {
                Self::advance(&mut history, &mut state, WorkflowState::ApprovalSkipped);
            }

            // Capability discovery.
            let catalog = match self.executor.discover().await {
                Ok(catalog) => catalog,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "capability discovery failed");
                    match self.handle_execution_failure(
                        &mut history,
                        &mut state,
                        &mut attempts_used,
                        action,
                        &e.to_string(),
                        e.is_retryable(),
                    ).await {
                        FailureVerdict::Retry => continue 'run,
                        FailureVerdict::GiveUp(reason) => break 'run (WorkflowState::Failed, reason),
                    }
                }
            };
            Self::advance(&mut history, &mut state, WorkflowState::CapabilityDiscoveryComplete);

            if !catalog.is_empty() && !catalog.contains(&proposal.tool_name) {
                let e = OpsError::tool_not_found(&proposal.tool_name);
                match self.handle_execution_failure(
                    &mut history,
                    &mut state,
                    &mut attempts_used,
                    action,
                    &e.to_string(),
                    false,
                ).await {
                    FailureVerdict::Retry => continue 'run,
                    FailureVerdict::GiveUp(reason) => break 'run (WorkflowState::Failed, reason),
                }
            }

            // Execution.
            let outcome = self
                .executor
                .execute(&proposal.tool_name, proposal.arguments.clone())
                .await;
            if outcome.success {
                last_outcome = Some(outcome);
                Self::advance(&mut history, &mut state, WorkflowState::ResultsProcessed);
                if proposal.continue_run && iterations < self.max_iterations {
                    Self::advance(&mut history, &mut state, WorkflowState::Continuing);
                    continue 'run;
                }
                Self::advance(&mut history, &mut state, WorkflowState::Completed);
                break 'run (WorkflowState::Completed, String::new());
            }

            let (message, retryable) = match &outcome.error {
                Some(record) => (record.message.clone(), record.is_retryable),
                None => ("tool execution failed".to_string(), false),
            };
            last_outcome = Some(outcome);
            match self.handle_execution_failure(
                &mut history,
                &mut state,
                &mut attempts_used,
                action,
                &message,
                retryable,
            ).await {
                FailureVerdict::Retry => continue 'run,
                FailureVerdict::GiveUp(reason) => break 'run (WorkflowState::Failed, reason),
            }
        };

        let success = final_state == WorkflowState::Completed;
        if success {
            info!(run_id = %run_id, iterations, "workflow run completed");
        } else {
            warn!(run_id = %run_id, reason = %reason, "workflow run failed");
        }
        WorkflowResult {
            run_id,
            workflow_name: action.workflow_name.clone(),
            success,
            final_state,
            iterations,
            reason,
            state_history: history,
            outcome: last_outcome,
        }
    }

    /// EXECUTION_FAILED handling: retry via ERROR_HANDLED while attempts
    /// remain and the failure is retryable, otherwise FAILED.
    async fn handle_execution_failure(
        &self,
        history: &mut Vec<WorkflowState>,
        state: &mut WorkflowState,
        attempts_used: &mut u32,
        action: &AiAction,
        message: &str,
        retryable: bool,
    ) -> FailureVerdict {
        Self::advance(history, state, WorkflowState::ExecutionFailed);
        if retryable && *attempts_used < action.retry_attempts {
            *attempts_used += 1;
            Self::advance(history, state, WorkflowState::ErrorHandled);
            debug!(attempt = *attempts_used, "retrying after handled error");
            tokio::time::sleep(clamp_delay(action.retry_delay)).await;
            return FailureVerdict::Retry;
        }
        Self::advance(history, state, WorkflowState::Failed);
        FailureVerdict::GiveUp(format!("execution_failed: {message}"))
    }
}

enum FailureVerdict {
    Retry,
    GiveUp(String),
}

/// Keep configured retry delays from stalling the whole engine.
fn clamp_delay(delay: Duration) -> Duration {
    delay.min(Duration::from_secs(60))
}

/// Test fixtures shared with the engine tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    struct EchoProposal;

    #[async_trait]
    impl ProposalSource for EchoProposal {
        async fn propose(&self, action: &AiAction, _iteration: u32) -> OpsResult<ToolProposal> {
            Ok(ToolProposal {
                tool_name: action.workflow_name.clone(),
                arguments: Value::Null,
                rendered_prompt: None,
                continue_run: false,
            })
        }
    }

    struct AlwaysOkExecutor;

    #[async_trait]
    impl ToolExecutor for AlwaysOkExecutor {
        async fn discover(&self) -> OpsResult<ToolCatalog> {
            Ok(ToolCatalog::new())
        }

        async fn execute(&self, tool_name: &str, _arguments: Value) -> ProposalOutcome {
            ProposalOutcome {
                success: true,
                data: Some(Value::from("ok")),
                error: None,
                tool_used: tool_name.to_string(),
            }
        }
    }

    /// Runner whose every collaborator succeeds immediately.
    pub(crate) fn instant_runner() -> Arc<WorkflowRunner> {
        Arc::new(WorkflowRunner::new(
            Arc::new(EchoProposal),
            Arc::new(AllowAllPolicy),
            Arc::new(AutoApprovalGate),
            Arc::new(AlwaysOkExecutor),
        ))
    }
}
