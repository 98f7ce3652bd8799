//! Run one engine cycle over fixture ClickUp tasks and print what happened.
//!
//! The MCP side is stubbed with an executor that records the proposed tool
//! call instead of reaching a real server, so the example runs standalone:
//!
//! ```bash
//! cargo run --example urgent_task_pipeline
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use opswatch::core::{ClickUpTask, Payload, TaskStatus};
use opswatch::engine::dispatch::RecordingSink;
use opswatch::engine::points::{SourceFeed, StaticFeed, UrgentTaskPoint};
use opswatch::engine::workflow::{
    AllowAllPolicy, AutoApprovalGate, TemplateProposalSource, ToolExecutor,
};
use opswatch::prelude::*;

/// Executor standing in for a real MCP server.
struct PrintingExecutor;

#[async_trait]
impl ToolExecutor for PrintingExecutor {
    async fn discover(&self) -> OpsResult<opswatch::client::ToolCatalog> {
        Ok(opswatch::client::ToolCatalog::new())
    }

    async fn execute(&self, tool_name: &str, arguments: Value) -> opswatch::client::ProposalOutcome {
        println!("-> would call tool '{tool_name}' with {arguments}");
        opswatch::client::ProposalOutcome {
            success: true,
            data: Some(Value::from("acknowledged")),
            error: None,
            tool_used: tool_name.to_string(),
        }
    }
}

fn task(id: &str, priority: &str, status: &str, name: &str) -> MonitoringData {
    MonitoringData::new(
        id,
        "clickup",
        Payload::ClickupTask(ClickUpTask {
            id: id.to_string(),
            name: name.to_string(),
            priority: Some(priority.to_string()),
            status: Some(TaskStatus {
                status: status.to_string(),
                color: None,
            }),
            assignees: vec!["user-42".to_string()],
            ..Default::default()
        }),
    )
    .expect("fixture ids are non-empty")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("opswatch=debug,info")
        .init();

    let prompts = Arc::new(PromptRegistry::new());
    prompts.register(PromptTemplate::new(
        "clickup_urgent_task_triage",
        "Triage urgent task {task_id} (priority {task_priority}): {reason}",
    ));

    let feed = Arc::new(StaticFeed::new());
    feed.push([
        task("task-1", "urgent", "open", "Production database outage"),
        task("task-2", "urgent", "completed", "Yesterday's incident"),
        task("task-3", "normal", "open", "Refresh the onboarding docs"),
    ]);

    let registry = Arc::new(Registry::new());
    registry
        .register(Arc::new(UrgentTaskPoint::new(
            Arc::clone(&feed) as Arc<dyn SourceFeed>
        )))
        .expect("urgent task point config is valid");

    let sink = Arc::new(RecordingSink::default());
    let dispatcher = Arc::new(ActionDispatcher::new(
        Arc::clone(&sink) as Arc<dyn opswatch::engine::ActionSink>
    ));
    let runner = Arc::new(WorkflowRunner::new(
        Arc::new(TemplateProposalSource::new(prompts)),
        Arc::new(AllowAllPolicy),
        Arc::new(AutoApprovalGate),
        Arc::new(PrintingExecutor),
    ));
    let engine = Engine::new(registry, dispatcher, runner, EngineConfig::default());

    let report = engine.run_cycle(&FetchParams::default()).await;

    println!("\npolled points: {:?}", report.points_polled);
    for item in &report.items {
        println!(
            "item {} -> {:?} ({} results, {} actions, {} workflows)",
            item.item.id(),
            item.item.status,
            item.results.len(),
            item.actions_executed.len(),
            item.workflow_results.len(),
        );
        for result in &item.results {
            println!(
                "  [{}] {:?} confidence={:.2} {}",
                result.cp_name, result.outcome, result.confidence, result.reason
            );
        }
        for workflow in &item.workflow_results {
            println!(
                "  workflow {} -> {} ({} states)",
                workflow.workflow_name,
                workflow.final_state.as_str(),
                workflow.state_history.len(),
            );
        }
    }

    println!("\nside effects:");
    for (kind, data_id, _parameters) in sink.records() {
        println!("  {kind} on {data_id}");
    }
}
