//! Seeded random DAG tests.
//!
//! Each case builds an acyclic step list, runs it, and checks the
//! scheduling rules against the outcome and the event history.

use std::collections::{BTreeMap, BTreeSet};

use devteam::config::Config;
use devteam::workflow::{
    DependentFailurePolicy, StepBlueprint, StepStatus, WorkflowStatus, WorkflowTemplate,
};
use devteam::events::EventType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Map;

use crate::fixtures::{
    orchestrator, random_dag, roomy_config, settle, step_events, workflow_events,
};

const CASES: u64 = 25;

/// Every step reachable upstream of `step_id`.
fn ancestors(steps: &[StepBlueprint], step_id: &str) -> BTreeSet<String> {
    let deps: BTreeMap<&str, &Vec<String>> = steps
        .iter()
        .map(|s| (s.step_id.as_str(), &s.depends_on))
        .collect();
    let mut seen = BTreeSet::new();
    let mut stack: Vec<String> = deps[step_id].clone();
    while let Some(id) = stack.pop() {
        if seen.insert(id.clone()) {
            stack.extend(deps[id.as_str()].iter().cloned());
        }
    }
    seen
}

/// Property: no step starts before all of its dependencies completed, and
/// the final status follows from the failures.
#[tokio::test]
async fn test_random_dags_respect_dependencies() {
    for seed in 0..CASES {
        let mut rng = StdRng::seed_from_u64(seed);
        let dag = random_dag(&mut rng);
        let (orch, _) = orchestrator(roomy_config()).await;
        let template_id = format!("random_{}", seed);
        orch.register_template(WorkflowTemplate::new(
            &template_id,
            "Random",
            "",
            dag.steps.clone(),
        ))
        .await
        .unwrap();

        let id = orch.start_workflow(&template_id, Map::new()).await.unwrap();
        let mut processor = orch.workflow_processor();
        settle(&mut processor).await;

        let snapshot = orch.workflow_status(id).await.unwrap();
        let events = workflow_events(&orch, id);

        // Ordering: every start comes after the completion of each dependency.
        let mut completed = BTreeSet::new();
        for event in &events {
            let Some(step_id) = event.get_str("step_id") else {
                continue;
            };
            match event.event_type() {
                EventType::WorkflowStepCompleted => {
                    completed.insert(step_id.to_string());
                }
                EventType::WorkflowStepStarted => {
                    let blueprint = dag.steps.iter().find(|s| s.step_id == step_id).unwrap();
                    for dep in &blueprint.depends_on {
                        assert!(
                            completed.contains(dep),
                            "seed {}: {} started before {}",
                            seed,
                            step_id,
                            dep
                        );
                    }
                }
                _ => {}
            }
        }

        // Each step started at most once.
        let started = step_events(&events, EventType::WorkflowStepStarted);
        let unique: BTreeSet<&String> = started.iter().collect();
        assert_eq!(unique.len(), started.len(), "seed {}", seed);

        // Outcome per step.
        let mut any_failed = false;
        for blueprint in &dag.steps {
            let upstream = ancestors(&dag.steps, &blueprint.step_id);
            let blocked = upstream.iter().any(|a| dag.failing.contains(a));
            let status = snapshot.steps[&blueprint.step_id];
            if blocked {
                assert_eq!(status, StepStatus::Pending, "seed {}", seed);
            } else if dag.failing.contains(&blueprint.step_id) {
                assert_eq!(status, StepStatus::Failed, "seed {}", seed);
                any_failed = true;
            } else {
                assert_eq!(status, StepStatus::Completed, "seed {}", seed);
            }
        }

        let expected = if any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        assert_eq!(snapshot.status, expected, "seed {}", seed);
    }
}

/// Property: with SkipDependents nothing is left Pending.
#[tokio::test]
async fn test_random_dags_skip_dependents() {
    for seed in 100..100 + CASES {
        let mut rng = StdRng::seed_from_u64(seed);
        let dag = random_dag(&mut rng);
        let config = Config {
            failure_policy: DependentFailurePolicy::SkipDependents,
            ..roomy_config()
        };
        let (orch, _) = orchestrator(config).await;
        orch.register_template(WorkflowTemplate::new("random", "Random", "", dag.steps.clone()))
            .await
            .unwrap();

        let id = orch.start_workflow("random", Map::new()).await.unwrap();
        let mut processor = orch.workflow_processor();
        settle(&mut processor).await;

        let snapshot = orch.workflow_status(id).await.unwrap();
        assert!(
            snapshot.steps.values().all(|s| s.is_terminal()),
            "seed {}: {:?}",
            seed,
            snapshot.steps
        );
        for blueprint in &dag.steps {
            let upstream = ancestors(&dag.steps, &blueprint.step_id);
            if upstream.iter().any(|a| dag.failing.contains(a)) {
                assert_eq!(
                    snapshot.steps[&blueprint.step_id],
                    StepStatus::Skipped,
                    "seed {}",
                    seed
                );
            }
        }
        let expected = if snapshot.failed_steps.is_empty() {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        assert_eq!(snapshot.status, expected, "seed {}", seed);
    }
}

/// Property: `update_status` only settles a workflow once every step is
/// terminal, and then picks Completed exactly when nothing failed.
#[tokio::test]
async fn test_update_status_rule_on_random_runs() {
    for seed in 200..200 + CASES {
        let mut rng = StdRng::seed_from_u64(seed);
        let dag = random_dag(&mut rng);
        let policy = if rng.gen_bool(0.5) {
            DependentFailurePolicy::SkipDependents
        } else {
            DependentFailurePolicy::LeaveBlocked
        };
        let template = WorkflowTemplate::new("random", "Random", "", dag.steps.clone());
        let mut workflow = template
            .create_workflow(&Map::new(), Map::new())
            .unwrap()
            .with_failure_policy(policy);
        workflow.start().unwrap();

        loop {
            let ready = workflow.ready_step_ids();
            if ready.is_empty() {
                break;
            }
            for step_id in ready {
                let fails = dag.failing.contains(&step_id);
                workflow
                    .execute_step(&step_id, |_task| async move {
                        if fails {
                            Err(devteam::Error::Execution("scripted".to_string()))
                        } else {
                            Ok(serde_json::json!({"ok": true}))
                        }
                    })
                    .await
                    .unwrap();

                let status = workflow.update_status();
                let all_terminal = workflow.steps().values().all(|s| s.status.is_terminal());
                assert_eq!(status.is_terminal(), all_terminal, "seed {}", seed);
                if all_terminal {
                    let expected = if workflow.failed_step_ids().is_empty() {
                        WorkflowStatus::Completed
                    } else {
                        WorkflowStatus::Failed
                    };
                    assert_eq!(status, expected, "seed {}", seed);
                }
            }
        }

        // Whatever is left is blocked behind a failure.
        workflow.reconcile();
        assert!(workflow.status().is_terminal(), "seed {}", seed);
        if workflow.status() == WorkflowStatus::Completed {
            assert!(workflow.failed_step_ids().is_empty());
            assert_eq!(workflow.completed_step_ids().len(), dag.steps.len());
        }
    }
}
