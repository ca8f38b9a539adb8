//! Workflow runtime: a DAG of steps with dependency-gated readiness.
//!
//! A `Workflow` owns its steps, tracks the frontier of steps whose
//! dependencies are satisfied, and derives its own status from the step
//! statuses. Running a step is split into [`Workflow::begin_step`] and
//! [`Workflow::finish_step`] so a caller can release its lock on the
//! workflow while the agent works; [`Workflow::execute_step`] joins the two
//! for callers that own the workflow outright.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::step::WorkflowStep;
use super::types::{DependentFailurePolicy, StepStatus, WorkflowId, WorkflowStatus};
use crate::agents::AgentTask;
use crate::core::dag::StepGraph;
use crate::core::task::TaskId;
use crate::events::{Event, EventBus, EventType};
use crate::{dlog, dlog_debug, dlog_error, dlog_warn, Error, Result};

/// Context key under which a completed step's result is stored.
pub fn result_key(step_id: &str) -> String {
    format!("step_{}_result", step_id)
}

pub struct Workflow {
    id: WorkflowId,
    name: String,
    description: String,
    steps: BTreeMap<String, WorkflowStep>,
    graph: StepGraph,
    status: WorkflowStatus,
    current_step_ids: Vec<String>,
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    context: Map<String, Value>,
    task_id: Option<TaskId>,
    failure_policy: DependentFailurePolicy,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    events: Option<EventBus>,
}

impl Workflow {
    /// Build a workflow in `Created` status.
    ///
    /// # Errors
    /// [`Error::Structural`] for duplicate step ids or a dependency on a step
    /// that is not part of the workflow. Cycles and missing roots are only
    /// detected by [`Workflow::start`] and the stall check.
    pub fn new(name: &str, description: &str, steps: Vec<WorkflowStep>) -> Result<Self> {
        let graph = StepGraph::build(steps.iter().map(|s| {
            (
                s.step_id.as_str(),
                s.depends_on.iter().map(String::as_str),
            )
        }))?;

        Ok(Self {
            id: WorkflowId::new(),
            name: name.to_string(),
            description: description.to_string(),
            steps: steps.into_iter().map(|s| (s.step_id.clone(), s)).collect(),
            graph,
            status: WorkflowStatus::Created,
            current_step_ids: Vec::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            context: Map::new(),
            task_id: None,
            failure_policy: DependentFailurePolicy::default(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            events: None,
        })
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_failure_policy(mut self, policy: DependentFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn link_task(&mut self, task_id: TaskId) {
        self.task_id = Some(task_id);
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn failure_policy(&self) -> DependentFailurePolicy {
        self.failure_policy
    }

    pub fn steps(&self) -> &BTreeMap<String, WorkflowStep> {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.get(step_id)
    }

    /// Steps whose dependencies are met and which have not finished.
    pub fn current_step_ids(&self) -> &[String] {
        &self.current_step_ids
    }

    pub fn completed_step_ids(&self) -> &BTreeSet<String> {
        &self.completed
    }

    pub fn failed_step_ids(&self) -> &BTreeSet<String> {
        &self.failed
    }

    pub fn skipped_step_ids(&self) -> &BTreeSet<String> {
        &self.skipped
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Frontier steps that have not been started yet.
    pub fn ready_step_ids(&self) -> Vec<String> {
        self.current_step_ids
            .iter()
            .filter(|id| self.step_status(id) == Some(StepStatus::Pending))
            .cloned()
            .collect()
    }

    pub fn in_progress_count(&self) -> usize {
        self.steps
            .values()
            .filter(|s| s.status == StepStatus::InProgress)
            .count()
    }

    fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|s| s.status)
    }

    fn emit(&self, event_type: EventType, mut data: Map<String, Value>) {
        if let Some(bus) = &self.events {
            if let Some(task_id) = self.task_id {
                data.insert("task_id".to_string(), json!(task_id.to_string()));
            }
            bus.publish(Event::workflow(event_type, &self.id.to_string(), data));
        }
    }

    fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Move to `Running`.
    ///
    /// From `Created` the frontier is seeded with every step that has no
    /// dependencies; a workflow without such a step fails immediately. From
    /// `Paused` the existing frontier is kept.
    pub fn start(&mut self) -> Result<()> {
        match self.status {
            WorkflowStatus::Created => {}
            WorkflowStatus::Paused => {
                self.status = WorkflowStatus::Running;
                self.update_frontier();
                dlog!("Workflow {} resumed", self.id.short());
                self.emit(
                    EventType::WorkflowUpdated,
                    crate::events::data([("status", json!("running"))]),
                );
                return Ok(());
            }
            other => {
                return Err(Error::InvalidWorkflowTransition {
                    from: other.to_string(),
                    to: WorkflowStatus::Running.to_string(),
                })
            }
        }

        self.status = WorkflowStatus::Running;
        self.started_at = Some(Utc::now());
        self.emit(
            EventType::WorkflowCreated,
            crate::events::data([
                ("name", json!(self.name)),
                ("steps", json!(self.steps.len())),
            ]),
        );

        self.current_step_ids = self
            .steps
            .values()
            .filter(|s| s.is_root())
            .map(|s| s.step_id.clone())
            .collect();

        if self.current_step_ids.is_empty() {
            dlog_error!("Workflow {} has no initial steps", self.id.short());
            self.finish(WorkflowStatus::Failed);
            self.emit(
                EventType::WorkflowFailed,
                crate::events::data([("error", json!("no initial steps"))]),
            );
            return Err(Error::Structural(format!(
                "workflow {} has no step without dependencies",
                self.id
            )));
        }

        dlog!(
            "Started workflow {} ({}) with {} steps",
            self.id.short(),
            self.name,
            self.steps.len()
        );
        Ok(())
    }

    /// Move a running workflow to `Paused`. In-flight steps still finish.
    pub fn pause(&mut self) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(Error::InvalidWorkflowTransition {
                from: self.status.to_string(),
                to: WorkflowStatus::Paused.to_string(),
            });
        }
        self.status = WorkflowStatus::Paused;
        dlog!("Workflow {} paused", self.id.short());
        self.emit(
            EventType::WorkflowUpdated,
            crate::events::data([("status", json!("paused"))]),
        );
        Ok(())
    }

    /// Mark the workflow `Cancelled`.
    ///
    /// Steps already in progress are not interrupted; their results are
    /// still recorded when they arrive.
    pub fn request_cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidWorkflowTransition {
                from: self.status.to_string(),
                to: WorkflowStatus::Cancelled.to_string(),
            });
        }
        self.finish(WorkflowStatus::Cancelled);
        dlog!(
            "Workflow {} cancelled with {} step(s) in progress",
            self.id.short(),
            self.in_progress_count()
        );
        self.emit(EventType::WorkflowCancelled, Map::new());
        Ok(())
    }

    /// Mark a ready step `InProgress` and build the agent task for it.
    ///
    /// # Errors
    /// Fails without changing anything if the workflow is not running, the
    /// step does not exist, a dependency has not completed, or the step is
    /// not `Pending`.
    pub fn begin_step(&mut self, step_id: &str) -> Result<AgentTask> {
        if self.status != WorkflowStatus::Running {
            return Err(Error::InvalidWorkflowTransition {
                from: self.status.to_string(),
                to: format!("step {}", step_id),
            });
        }

        let step = self.steps.get(step_id).ok_or_else(|| Error::StepNotFound {
            workflow: self.id,
            step: step_id.to_string(),
        })?;

        if let Some(dep) = step.depends_on.iter().find(|d| !self.completed.contains(*d)) {
            return Err(Error::DependencyNotMet {
                step: step_id.to_string(),
                dependency: dep.clone(),
            });
        }

        if step.status != StepStatus::Pending {
            return Err(Error::InvalidStepState {
                step: step_id.to_string(),
                status: step.status.to_string(),
            });
        }

        let task = AgentTask::new(&step.agent_type, step.task_blueprint.clone())
            .with_context(self.context.clone())
            .for_step(self.id, step_id);
        let agent_type = step.agent_type.clone();

        if let Some(step) = self.steps.get_mut(step_id) {
            step.mark_started(task.id.clone());
        }

        dlog_debug!(
            "Workflow {}: step {} started on {}",
            self.id.short(),
            step_id,
            agent_type
        );
        self.emit(
            EventType::WorkflowStepStarted,
            crate::events::data([
                ("step_id", json!(step_id)),
                ("agent_type", json!(agent_type)),
            ]),
        );
        Ok(task)
    }

    /// Record the outcome of a step started with [`Workflow::begin_step`].
    ///
    /// Returns whether the step completed. A successful result is stored in
    /// the context under [`result_key`] and the frontier is recomputed.
    pub fn finish_step(&mut self, step_id: &str, outcome: Result<Value>) -> Result<bool> {
        let workflow = self.id;
        let policy = self.failure_policy;
        let step = self
            .steps
            .get_mut(step_id)
            .ok_or_else(|| Error::StepNotFound {
                workflow,
                step: step_id.to_string(),
            })?;

        if step.status != StepStatus::InProgress {
            return Err(Error::InvalidStepState {
                step: step_id.to_string(),
                status: step.status.to_string(),
            });
        }

        self.current_step_ids.retain(|id| id != step_id);

        let succeeded = match outcome {
            Ok(result) => {
                step.mark_completed(result.clone());
                self.completed.insert(step_id.to_string());
                self.context.insert(result_key(step_id), result);
                dlog!("Workflow {}: step {} completed", workflow.short(), step_id);
                self.emit(
                    EventType::WorkflowStepCompleted,
                    crate::events::data([("step_id", json!(step_id))]),
                );
                true
            }
            Err(e) => {
                let error = e.to_string();
                step.mark_failed(error.clone());
                self.failed.insert(step_id.to_string());
                dlog_warn!(
                    "Workflow {}: step {} failed: {}",
                    workflow.short(),
                    step_id,
                    error
                );
                self.emit(
                    EventType::WorkflowStepFailed,
                    crate::events::data([("step_id", json!(step_id)), ("error", json!(error))]),
                );
                if policy == DependentFailurePolicy::SkipDependents {
                    self.skip_dependents_of(step_id);
                }
                false
            }
        };

        self.update_frontier();
        Ok(succeeded)
    }

    /// Run one step to completion through `executor`.
    ///
    /// `executor` receives the built agent task; its `Err` marks the step
    /// failed. Guard failures are returned as `Err` with no state change.
    pub async fn execute_step<F, Fut>(&mut self, step_id: &str, executor: F) -> Result<bool>
    where
        F: FnOnce(AgentTask) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let task = self.begin_step(step_id)?;
        let outcome = executor(task).await;
        self.finish_step(step_id, outcome)
    }

    fn skip_dependents_of(&mut self, step_id: &str) {
        for dependent in self.graph.transitive_dependents(step_id) {
            if let Some(step) = self.steps.get_mut(&dependent) {
                if step.status == StepStatus::Pending {
                    step.mark_skipped(format!("dependency {} failed", step_id));
                    self.skipped.insert(dependent.clone());
                    self.current_step_ids.retain(|id| *id != dependent);
                    dlog_debug!("Workflow {}: step {} skipped", self.id.short(), dependent);
                }
            }
        }
    }

    fn update_frontier(&mut self) {
        for step in self.steps.values() {
            if step.status != StepStatus::Pending {
                continue;
            }
            let ready = step.depends_on.iter().all(|d| self.completed.contains(d));
            if ready && !self.current_step_ids.contains(&step.step_id) {
                self.current_step_ids.push(step.step_id.clone());
            }
        }
    }

    /// Derive a terminal status once every step has finished.
    ///
    /// Only acts while `Running`: `Completed` when no step failed, otherwise
    /// `Failed`. Calling it again after the transition does nothing.
    pub fn update_status(&mut self) -> WorkflowStatus {
        if self.status != WorkflowStatus::Running {
            return self.status;
        }
        if !self.steps.values().all(|s| s.status.is_terminal()) {
            return self.status;
        }

        if self.failed.is_empty() {
            self.finish(WorkflowStatus::Completed);
            dlog!("Workflow {} completed", self.id.short());
            self.emit(EventType::WorkflowCompleted, Map::new());
        } else {
            self.finish(WorkflowStatus::Failed);
            dlog!(
                "Workflow {} failed with {} failed step(s) out of {}",
                self.id.short(),
                self.failed.len(),
                self.steps.len()
            );
            self.emit(
                EventType::WorkflowFailed,
                crate::events::data([("failed_steps", json!(self.failed))]),
            );
        }
        self.status
    }

    /// Fail a running workflow that can no longer make progress.
    ///
    /// That is the case when nothing is in progress, no step is ready, and
    /// some step is still `Pending`. The blocked steps stay `Pending`.
    /// Returns true if the workflow was failed.
    pub fn resolve_stall(&mut self) -> bool {
        if self.status != WorkflowStatus::Running
            || !self.current_step_ids.is_empty()
            || self.in_progress_count() > 0
        {
            return false;
        }

        let blocked: Vec<String> = self
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.step_id.clone())
            .collect();
        if blocked.is_empty() {
            return false;
        }

        dlog_warn!(
            "Workflow {} stalled; blocked steps: {}",
            self.id.short(),
            blocked.join(", ")
        );
        self.finish(WorkflowStatus::Failed);
        self.emit(
            EventType::WorkflowFailed,
            crate::events::data([
                ("failed_steps", json!(self.failed)),
                ("blocked_steps", json!(blocked)),
            ]),
        );
        true
    }

    /// [`Workflow::update_status`] followed by [`Workflow::resolve_stall`].
    pub fn reconcile(&mut self) -> WorkflowStatus {
        self.update_status();
        self.resolve_stall();
        self.status
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            status: self.status,
            task_id: self.task_id,
            steps: self
                .steps
                .iter()
                .map(|(id, s)| (id.clone(), s.status))
                .collect(),
            current_steps: self.current_step_ids.clone(),
            completed_steps: self.completed.iter().cloned().collect(),
            failed_steps: self.failed.iter().cloned().collect(),
            skipped_steps: self.skipped.iter().cloned().collect(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.id,
            name: self.name.clone(),
            status: self.status,
            steps_total: self.steps.len(),
            steps_completed: self.completed.len(),
            steps_failed: self.failed.len(),
            started_at: self.started_at,
        }
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("current_step_ids", &self.current_step_ids)
            .field("completed", &self.completed)
            .field("failed", &self.failed)
            .field("skipped", &self.skipped)
            .finish()
    }
}

/// Point-in-time view of a workflow for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub task_id: Option<TaskId>,
    pub steps: BTreeMap<String, StepStatus>,
    pub current_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Compact listing entry for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub started_at: Option<DateTime<Utc>>,
}
