//! End-to-end task and workflow tests.
//!
//! These tests submit work through the orchestrator and follow it through
//! the processors until it settles.

use std::time::Duration;

use serde_json::json;

use devteam::config::Config;
use devteam::core::task::{TaskStatus, TaskSubmission, TaskType};
use devteam::events::EventType;
use devteam::workflow::{StepStatus, WorkflowStatus, WorkflowTemplate};

use crate::fixtures::{
    diamond_template, no_params, orchestrator, roomy_config, settle, step, step_events,
    workflow_events,
};

/// Test: Diamond with a failing branch
/// Given A, then B and C after A, then D after B and C, where B fails
/// When the workflow runs
/// Then C still runs, D stays Pending and the workflow ends Failed
#[tokio::test]
async fn test_diamond_partial_failure() {
    let (orch, _) = orchestrator(roomy_config()).await;
    orch.register_template(diamond_template("diamond")).await.unwrap();
    let mut processor = orch.workflow_processor();

    let id = orch.start_workflow("diamond", no_params()).await.unwrap();
    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Running);
    assert_eq!(snapshot.current_steps, vec!["a".to_string()]);

    // Round 1: A
    assert_eq!(processor.tick().await.steps_started, 1);
    processor.drain().await;
    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.steps["a"], StepStatus::Completed);
    assert_eq!(
        snapshot.current_steps,
        vec!["b".to_string(), "c".to_string()]
    );

    // Round 2: B fails, C completes
    assert_eq!(processor.tick().await.steps_started, 2);
    processor.drain().await;

    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.steps["b"], StepStatus::Failed);
    assert_eq!(snapshot.steps["c"], StepStatus::Completed);
    assert_eq!(snapshot.steps["d"], StepStatus::Pending);
    assert!(snapshot.current_steps.is_empty());
    assert_eq!(snapshot.failed_steps, vec!["b".to_string()]);
    assert!(snapshot.ended_at.is_some());

    // Nothing left to do
    assert_eq!(processor.tick().await.steps_started, 0);

    let events = workflow_events(&orch, id);
    let started = step_events(&events, EventType::WorkflowStepStarted);
    assert!(!started.contains(&"d".to_string()));
    assert_eq!(
        events.last().map(|e| e.event_type()),
        Some(EventType::WorkflowFailed)
    );
}

/// Test: Independent branches overlap
/// Given B and C both ready after A
/// When the processor starts them
/// Then both agent calls are in flight together
#[tokio::test(start_paused = true)]
async fn test_ready_branches_run_concurrently() {
    let (orch, stats) = orchestrator(roomy_config()).await;
    let slow = |id: &str, deps: &[&str]| {
        step(id, deps, "ok").task(json!({"type": "work", "sleep_ms": 50}))
    };
    orch.register_template(WorkflowTemplate::new(
        "fan_out",
        "Fan out",
        "",
        vec![
            step("a", &[], "ok"),
            slow("b", &["a"]),
            slow("c", &["a"]),
            step("d", &["b", "c"], "ok"),
        ],
    ))
    .await
    .unwrap();

    let id = orch.start_workflow("fan_out", no_params()).await.unwrap();
    let mut processor = orch.workflow_processor();
    settle(&mut processor).await;

    assert_eq!(
        orch.workflow_status(id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert_eq!(stats.calls(), 4);
    assert_eq!(stats.max_running(), 2);
}

/// Test: Feature task through the background loops
/// Given a running orchestrator with the built-in agents
/// When a feature task is submitted
/// Then it completes with every step result in its result
#[tokio::test]
async fn test_feature_task_through_loops() {
    let (orch, _) = orchestrator(roomy_config()).await;
    let handle = orch.start();

    let id = orch
        .submit(TaskSubmission::new(
            "User login",
            "Email and password sign in",
            TaskType::Feature,
        ))
        .await
        .unwrap();
    let task = orch.wait_for_task(id, Duration::from_secs(10)).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    let result = task.result.clone().unwrap();
    for step_id in ["planning", "code_analysis", "implementation", "testing"] {
        assert!(
            result.get(format!("step_{}_result", step_id)).is_some(),
            "missing result for {}",
            step_id
        );
    }
    assert_eq!(result["task_id"], id.to_string());

    let task_events: Vec<EventType> = orch
        .event_history(None, usize::MAX)
        .iter()
        .filter(|e| e.source() == "task" && e.get_str("task_id") == Some(id.to_string().as_str()))
        .map(|e| e.event_type())
        .collect();
    assert_eq!(
        task_events,
        vec![
            EventType::TaskCreated,
            EventType::TaskStarted,
            EventType::TaskUpdated,
            EventType::TaskCompleted,
        ]
    );

    let workflow_id = task.workflow_id.unwrap();
    let events = workflow_events(&orch, workflow_id);
    assert_eq!(
        events.first().map(|e| e.event_type()),
        Some(EventType::WorkflowCreated)
    );
    assert!(events
        .iter()
        .any(|e| e.event_type() == EventType::WorkflowCompleted));

    assert!(handle.shutdown().await.unwrap());
}

/// Test: Non-feature tasks skip the workflow engine
#[tokio::test]
async fn test_direct_tasks_through_loops() {
    let (orch, _) = orchestrator(roomy_config()).await;
    let handle = orch.start();

    let mut ids = Vec::new();
    for task_type in [
        TaskType::Bugfix,
        TaskType::Analysis,
        TaskType::Testing,
        TaskType::Documentation,
    ] {
        ids.push(
            orch.submit(TaskSubmission::new("Work", "Do it", task_type))
                .await
                .unwrap(),
        );
    }

    for id in ids {
        let task = orch.wait_for_task(id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        assert!(task.workflow_id.is_none());
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());
    }
    assert!(orch.list_workflows(None).await.is_empty());

    handle.shutdown().await.unwrap();
}

/// Test: Later steps see earlier results in their context
#[tokio::test]
async fn test_context_accumulates_step_results() {
    let config = Config {
        feature_template: Some("chain".to_string()),
        ..roomy_config()
    };
    let (orch, _) = orchestrator(config).await;
    orch.register_template(WorkflowTemplate::new(
        "chain",
        "Chain",
        "",
        vec![
            step("first", &[], "ok"),
            step("second", &["first"], "ok"),
        ],
    ))
    .await
    .unwrap();

    let tasks = orch.task_processor();
    let mut processor = orch.workflow_processor();
    let id = orch
        .submit(TaskSubmission::new("Chain", "two steps", TaskType::Feature))
        .await
        .unwrap();
    tasks.tick().await;
    settle(&mut processor).await;

    let task = orch.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let result = task.result.unwrap();
    let seen_by_second = result["step_second_result"]["seen"].as_array().unwrap();
    assert!(seen_by_second.contains(&json!("step_first_result")));
    assert!(seen_by_second.contains(&json!("task")));
    let seen_by_first = result["step_first_result"]["seen"].as_array().unwrap();
    assert!(!seen_by_first.contains(&json!("step_second_result")));
}

/// Test: Workflow listing and status filters
#[tokio::test]
async fn test_list_workflows_by_status() {
    let (orch, _) = orchestrator(roomy_config()).await;
    orch.register_template(diamond_template("diamond")).await.unwrap();
    let mut processor = orch.workflow_processor();

    let failed = orch.start_workflow("diamond", no_params()).await.unwrap();
    settle(&mut processor).await;
    let running = orch
        .start_workflow("feature_implementation", no_params())
        .await
        .unwrap();

    let all = orch.list_workflows(None).await;
    assert_eq!(all.len(), 2);

    let failures = orch.list_workflows(Some(WorkflowStatus::Failed)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].workflow_id, failed);
    assert_eq!(failures[0].steps_total, 4);
    assert_eq!(failures[0].steps_completed, 2);
    assert_eq!(failures[0].steps_failed, 1);

    let live = orch.list_workflows(Some(WorkflowStatus::Running)).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].workflow_id, running);
}

/// Test: Pause holds the frontier and resume picks it up again
#[tokio::test]
async fn test_pause_and_resume() {
    let (orch, stats) = orchestrator(roomy_config()).await;
    orch.register_template(WorkflowTemplate::new(
        "pair",
        "Pair",
        "",
        vec![step("a", &[], "ok"), step("b", &["a"], "ok")],
    ))
    .await
    .unwrap();
    let mut processor = orch.workflow_processor();
    let id = orch.start_workflow("pair", no_params()).await.unwrap();

    processor.tick().await;
    processor.drain().await;
    orch.pause_workflow(id).await.unwrap();
    settle(&mut processor).await;

    let snapshot = orch.workflow_status(id).await.unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Paused);
    assert_eq!(snapshot.steps["b"], StepStatus::Pending);
    assert_eq!(stats.calls(), 1);
    assert!(orch.pause_workflow(id).await.is_err());

    orch.resume_workflow(id).await.unwrap();
    settle(&mut processor).await;
    assert_eq!(
        orch.workflow_status(id).await.unwrap().status,
        WorkflowStatus::Completed
    );
    assert_eq!(stats.calls(), 2);
}
