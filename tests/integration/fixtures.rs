//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scriptable `worker` agent whose behaviour is chosen per step payload
//! - Orchestrators wired with the worker and the built-in agents
//! - Driving the processors by hand until every workflow settles
//! - Seeded random DAGs

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use serde_json::{json, Map, Value};

use devteam::agents::{Agent, AgentTask, FnFactory};
use devteam::config::Config;
use devteam::events::{Event, EventType};
use devteam::orchestration::{Orchestrator, WorkflowProcessor};
use devteam::workflow::{StepBlueprint, WorkflowId, WorkflowTemplate};
use devteam::{Error, Result};

pub const WORKER: &str = "worker";

/// Counters shared between a test and every worker instance.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// When false, `shutdown` refuses.
    pub shutdown_ok: AtomicBool,
}

impl WorkerStats {
    pub fn new() -> Arc<Self> {
        let stats = Self::default();
        stats.shutdown_ok.store(true, Ordering::SeqCst);
        Arc::new(stats)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// Agent whose outcome is read from the task payload.
///
/// - `outcome = "fail"` returns an execution error
/// - `outcome = "panic"` panics
/// - `sleep_ms` delays the result
///
/// Anything else echoes the step id and payload.
pub struct Worker {
    stats: Arc<WorkerStats>,
}

#[async_trait]
impl Agent for Worker {
    fn agent_type(&self) -> &str {
        WORKER
    }

    fn name(&self) -> &str {
        "Scripted Worker"
    }

    fn shutdown(&self) -> bool {
        self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stats.shutdown_ok.load(Ordering::SeqCst)
    }

    async fn process_task(&self, task: AgentTask) -> Result<Value> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = task.payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.stats.running.fetch_sub(1, Ordering::SeqCst);

        match task.payload_str("outcome") {
            Some("fail") => Err(Error::Execution(format!(
                "step {} refused",
                task.step_id.as_deref().unwrap_or("?")
            ))),
            Some("panic") => panic!("worker exploded"),
            _ => Ok(json!({
                "step": task.step_id,
                "payload": task.payload,
                "seen": task.context.keys().cloned().collect::<Vec<_>>(),
            })),
        }
    }
}

/// Builtin agents plus the scripted worker.
pub async fn orchestrator(config: Config) -> (Orchestrator, Arc<WorkerStats>) {
    let orch = Orchestrator::with_builtin_agents(config).await;
    let stats = WorkerStats::new();
    let shared = stats.clone();
    orch.register_agent(Arc::new(FnFactory::new(WORKER, move || {
        Arc::new(Worker {
            stats: shared.clone(),
        }) as Arc<dyn Agent>
    })))
    .await;
    (orch, stats)
}

pub fn roomy_config() -> Config {
    Config {
        max_history: Some(100_000),
        idle_interval_ms: Some(10),
        rescan_interval_ms: Some(10),
        ..Default::default()
    }
}

/// Worker step with the given behaviour.
pub fn step(id: &str, deps: &[&str], outcome: &str) -> StepBlueprint {
    StepBlueprint::new(id, &id.to_uppercase(), WORKER)
        .depends_on(deps)
        .task(json!({"type": "work", "outcome": outcome}))
}

/// A (root), B and C (after A), D (after B and C). B fails.
pub fn diamond_template(template_id: &str) -> WorkflowTemplate {
    WorkflowTemplate::new(
        template_id,
        "Diamond",
        "Two branches joining on D",
        vec![
            step("a", &[], "ok"),
            step("b", &["a"], "fail"),
            step("c", &["a"], "ok"),
            step("d", &["b", "c"], "ok"),
        ],
    )
}

/// Tick and drain the processor until a pass starts nothing.
pub async fn settle(processor: &mut WorkflowProcessor) {
    for _ in 0..200 {
        let report = processor.tick().await;
        processor.drain().await;
        if report.steps_started == 0 {
            return;
        }
    }
    panic!("workflows did not settle");
}

/// Events for one workflow, oldest first.
pub fn workflow_events(orch: &Orchestrator, id: WorkflowId) -> Vec<Event> {
    let id = id.to_string();
    orch.event_history(None, usize::MAX)
        .into_iter()
        .filter(|e| e.get_str("workflow_id") == Some(id.as_str()))
        .collect()
}

pub fn step_events(events: &[Event], event_type: EventType) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type() == event_type)
        .filter_map(|e| e.get_str("step_id").map(str::to_string))
        .collect()
}

pub fn no_params() -> Map<String, Value> {
    Map::new()
}

/// Random acyclic step list: edges only point at earlier steps.
pub struct RandomDag {
    pub steps: Vec<StepBlueprint>,
    pub failing: Vec<String>,
}

pub fn random_dag(rng: &mut StdRng) -> RandomDag {
    let count = rng.gen_range(2..10);
    let mut steps = Vec::with_capacity(count);
    let mut failing = Vec::new();

    for i in 0..count {
        let id = format!("s{}", i);
        let deps: Vec<String> = (0..i)
            .filter(|_| rng.gen_bool(0.35))
            .map(|j| format!("s{}", j))
            .collect();
        let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
        let outcome = if rng.gen_bool(0.15) {
            failing.push(id.clone());
            "fail"
        } else {
            "ok"
        };
        steps.push(step(&id, &dep_refs, outcome));
    }
    RandomDag { steps, failing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_random_dag_is_reproducible() {
        let a = random_dag(&mut StdRng::seed_from_u64(7));
        let b = random_dag(&mut StdRng::seed_from_u64(7));
        assert_eq!(a.steps, b.steps);
        assert_eq!(a.failing, b.failing);
    }

    #[test]
    fn test_random_dag_only_points_backwards() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let dag = random_dag(&mut rng);
            assert!(dag.steps[0].depends_on.is_empty());
            for (i, step) in dag.steps.iter().enumerate() {
                for dep in &step.depends_on {
                    let j: usize = dep[1..].parse().unwrap();
                    assert!(j < i);
                }
            }
        }
    }

    #[test]
    fn test_diamond_template_is_valid() {
        diamond_template("diamond").validate().unwrap();
    }
}
