//! Failure handling and recovery tests.
//!
//! Agents that error, panic, hang or refuse to start must only ever fail
//! their own step. Shutdown is retried until every agent agrees.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use devteam::agents::{Agent, AgentTask, FnFactory};
use devteam::config::Config;
use devteam::core::task::{TaskStatus, TaskSubmission, TaskType};
use devteam::events::EventType;
use devteam::workflow::{DependentFailurePolicy, StepStatus, WorkflowStatus, WorkflowTemplate};
use devteam::Result;

use crate::fixtures::{
    diamond_template, no_params, orchestrator, roomy_config, settle, step, step_events,
    workflow_events,
};

/// Test: A panicking agent fails its step only
/// Given two workflows, one whose step panics
/// When both run
/// Then the panicking one fails and the other completes
#[tokio::test]
async fn test_agent_panic_fails_step() {
    let (orch, _) = orchestrator(roomy_config()).await;
    orch.register_template(WorkflowTemplate::new(
        "explodes",
        "Explodes",
        "",
        vec![step("boom", &[], "panic"), step("after", &["boom"], "ok")],
    ))
    .await
    .unwrap();
    orch.register_template(WorkflowTemplate::new(
        "calm",
        "Calm",
        "",
        vec![step("only", &[], "ok")],
    ))
    .await
    .unwrap();

    let bad = orch.start_workflow("explodes", no_params()).await.unwrap();
    let good = orch.start_workflow("calm", no_params()).await.unwrap();
    let mut processor = orch.workflow_processor();
    settle(&mut processor).await;

    let snapshot = orch.workflow_status(bad).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps["boom"], StepStatus::Failed);
    assert_eq!(snapshot.steps["after"], StepStatus::Pending);
    assert_eq!(
        orch.workflow_status(good).await.unwrap().status,
        WorkflowStatus::Completed
    );

    let failures = orch.event_history(Some(&[EventType::AgentFailed]), 10);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].get_str("error").unwrap().contains("join"));
}

/// Test: A hung agent times out
#[tokio::test(start_paused = true)]
async fn test_step_timeout_fails_step() {
    let config = Config {
        step_timeout_secs: Some(1),
        ..roomy_config()
    };
    let (orch, _) = orchestrator(config).await;
    orch.register_template(WorkflowTemplate::new(
        "hang",
        "Hang",
        "",
        vec![step("wait", &[], "ok").task(json!({"type": "work", "sleep_ms": 60_000}))],
    ))
    .await
    .unwrap();

    let id = orch.start_workflow("hang", no_params()).await.unwrap();
    let mut processor = orch.workflow_processor();
    settle(&mut processor).await;

    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps["wait"], StepStatus::Failed);

    let failed = orch.event_history(Some(&[EventType::WorkflowStepFailed]), 10);
    assert!(failed[0].get_str("error").unwrap().contains("timed out"));
}

/// Test: Direct tasks time out the same way
#[tokio::test(start_paused = true)]
async fn test_direct_task_timeout() {
    struct Stuck;

    #[async_trait]
    impl Agent for Stuck {
        fn agent_type(&self) -> &str {
            "project_manager"
        }

        fn name(&self) -> &str {
            "Stuck Manager"
        }

        async fn process_task(&self, _task: AgentTask) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    let config = Config {
        step_timeout_secs: Some(2),
        ..roomy_config()
    };
    let orch = devteam::Orchestrator::new(config);
    orch.register_agent(Arc::new(FnFactory::new("project_manager", || {
        Arc::new(Stuck) as Arc<dyn Agent>
    })))
    .await;

    let id = orch
        .submit(TaskSubmission::new("Fix", "Hangs", TaskType::Bugfix))
        .await
        .unwrap();
    orch.task_processor().tick().await;

    let task = orch.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("timed out"));
}

/// Test: Agents that fail to initialize fail the step
#[tokio::test]
async fn test_agent_init_failure() {
    struct Reluctant;

    #[async_trait]
    impl Agent for Reluctant {
        fn agent_type(&self) -> &str {
            "reluctant"
        }

        fn name(&self) -> &str {
            "Reluctant"
        }

        fn initialize(&self) -> bool {
            false
        }

        async fn process_task(&self, _task: AgentTask) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    let (orch, _) = orchestrator(roomy_config()).await;
    orch.register_agent(Arc::new(FnFactory::new("reluctant", || {
        Arc::new(Reluctant) as Arc<dyn Agent>
    })))
    .await;
    orch.register_template(WorkflowTemplate::new(
        "needs_reluctant",
        "Needs reluctant",
        "",
        vec![devteam::workflow::StepBlueprint::new("r", "R", "reluctant")
            .task(json!({"type": "work"}))],
    ))
    .await
    .unwrap();

    let id = orch.start_workflow("needs_reluctant", Map::new()).await.unwrap();
    let mut processor = orch.workflow_processor();
    settle(&mut processor).await;

    assert_eq!(
        orch.workflow_status(id).await.unwrap().status,
        WorkflowStatus::Failed
    );
    assert_eq!(orch.registry().read().await.live_count(), 0);
}

/// Test: Diamond with SkipDependents
/// Given the diamond where B fails and the skip policy
/// When it runs
/// Then D is Skipped rather than left Pending
#[tokio::test]
async fn test_skip_dependents_policy() {
    let config = Config {
        failure_policy: DependentFailurePolicy::SkipDependents,
        ..roomy_config()
    };
    let (orch, stats) = orchestrator(config).await;
    orch.register_template(diamond_template("diamond")).await.unwrap();

    let id = orch.start_workflow("diamond", no_params()).await.unwrap();
    let mut processor = orch.workflow_processor();
    settle(&mut processor).await;

    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps["d"], StepStatus::Skipped);
    assert_eq!(snapshot.skipped_steps, vec!["d".to_string()]);
    assert_eq!(stats.calls(), 3);

    let events = workflow_events(&orch, id);
    assert!(!step_events(&events, EventType::WorkflowStepStarted).contains(&"d".to_string()));
}

/// Test: Shutdown retry
/// Given a live agent that refuses to shut down
/// When the orchestrator shuts down
/// Then it reports failure, keeps the agents, and a later retry asks all
/// of them again
#[tokio::test]
async fn test_shutdown_retry_asks_every_agent() {
    let (orch, stats) = orchestrator(roomy_config()).await;
    orch.register_template(WorkflowTemplate::new(
        "single",
        "Single",
        "",
        vec![step("only", &[], "ok")],
    ))
    .await
    .unwrap();

    let handle = orch.start();
    let bugfix = orch
        .submit(TaskSubmission::new("Fix", "Typo", TaskType::Bugfix))
        .await
        .unwrap();
    orch.wait_for_task(bugfix, Duration::from_secs(5))
        .await
        .unwrap();
    let id = orch.start_workflow("single", no_params()).await.unwrap();
    for _ in 0..200 {
        if orch.workflow_status(id).await.unwrap().status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stats.shutdown_ok.store(false, Ordering::SeqCst);
    assert!(!handle.shutdown().await.unwrap());

    let registry = orch.registry();
    assert_eq!(registry.read().await.live_count(), 2);
    assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 1);

    stats.shutdown_ok.store(true, Ordering::SeqCst);
    assert!(registry.write().await.shutdown_agents());
    assert_eq!(stats.shutdowns.load(Ordering::SeqCst), 2);
    assert_eq!(registry.read().await.live_count(), 0);
}
