//! Shared orchestrator state and the public entrypoints.
//!
//! The `Orchestrator` is a cheap handle over state shared with the two
//! background processors. Each structure has its own lock and no code path
//! holds two of them at once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::agents::builtin::register_builtin_agents;
use crate::agents::{AgentFactory, AgentRegistry};
use crate::config::Config;
use crate::core::task::{Task, TaskId, TaskStatus, TaskSubmission};
use crate::events::{data, Event, EventBus, EventType};
use crate::workflow::{
    feature_template, Workflow, WorkflowId, WorkflowSnapshot, WorkflowStatus, WorkflowSummary,
    WorkflowTemplate,
};
use crate::{dlog, dlog_debug, dlog_warn, Error, Result};

/// Task records plus the FIFO queue of task ids awaiting the TaskProcessor.
#[derive(Debug, Default)]
pub(crate) struct TaskBoard {
    pub queue: VecDeque<TaskId>,
    pub tasks: HashMap<TaskId, Task>,
}

/// Terminal transition applied to a task.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Completed(Option<Value>),
    Failed(String),
    Cancelled,
}

impl Settlement {
    fn event_type(&self) -> EventType {
        match self {
            Settlement::Completed(_) => EventType::TaskCompleted,
            Settlement::Failed(_) => EventType::TaskFailed,
            Settlement::Cancelled => EventType::TaskCancelled,
        }
    }
}

/// Result of [`Orchestrator::cancel_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The task is now `Cancelled`.
    Cancelled,
    /// The task's workflow was cancelled; the task settles on the next
    /// workflow pass.
    Requested,
}

pub(crate) struct Shared {
    pub config: Config,
    pub events: EventBus,
    pub registry: Arc<RwLock<AgentRegistry>>,
    pub tasks: RwLock<TaskBoard>,
    pub workflows: RwLock<HashMap<WorkflowId, Arc<RwLock<Workflow>>>>,
    /// Workflows the WorkflowProcessor still has to drive, in start order.
    pub active: RwLock<Vec<WorkflowId>>,
    pub templates: RwLock<HashMap<String, WorkflowTemplate>>,
    pub task_wake: Notify,
    pub workflow_wake: Notify,
    pub task_settled: Notify,
}

impl Shared {
    pub fn task_event(&self, event_type: EventType, task: &Task, mut fields: Map<String, Value>) {
        fields.insert("title".to_string(), json!(task.title));
        fields.insert("status".to_string(), json!(task.status));
        self.events
            .publish(Event::task(event_type, &task.id.to_string(), fields));
    }

    /// Apply a terminal transition unless the task has already settled.
    ///
    /// The task also leaves the queue. Returns false when the task is
    /// unknown or already terminal.
    pub async fn settle_task(&self, id: TaskId, settlement: Settlement) -> bool {
        let settled = {
            let mut board = self.tasks.write().await;
            settle_on_board(&mut board, id, &settlement)
        };
        match settled {
            Some(task) => {
                self.announce_settlement(&task, &settlement);
                true
            }
            None => false,
        }
    }

    /// Publish the event for a task that `settle_on_board` just settled.
    pub fn announce_settlement(&self, task: &Task, settlement: &Settlement) {
        dlog!("Task {} {}", task.id.short(), task.status);
        let mut fields = Map::new();
        if let Some(error) = &task.error {
            fields.insert("error".to_string(), json!(error));
        }
        if let Some(workflow_id) = task.workflow_id {
            fields.insert("workflow_id".to_string(), json!(workflow_id.to_string()));
        }
        self.task_event(settlement.event_type(), task, fields);
        self.task_settled.notify_waiters();
    }

    /// Instantiate a template, optionally bound to a task, and start it.
    ///
    /// The workflow is stored before the task is linked to it, so a linked
    /// `workflow_id` always resolves. If the task settled in the meantime
    /// the workflow is cancelled before it is ever activated.
    pub async fn launch_workflow(
        &self,
        template_id: &str,
        params: &Map<String, Value>,
        context: Map<String, Value>,
        task_id: Option<TaskId>,
    ) -> Result<WorkflowId> {
        let mut workflow = {
            let templates = self.templates.read().await;
            let template = templates
                .get(template_id)
                .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;
            template.create_workflow(params, context)?
        }
        .with_event_bus(self.events.clone())
        .with_failure_policy(self.config.failure_policy);
        let workflow_id = workflow.id();
        if let Some(task_id) = task_id {
            workflow.link_task(task_id);
        }

        // A workflow that fails to start stays queryable with status Failed.
        let started = workflow.start();
        let handle = Arc::new(RwLock::new(workflow));
        self.workflows
            .write()
            .await
            .insert(workflow_id, handle.clone());

        if let Some(task_id) = task_id {
            let linked = {
                let mut board = self.tasks.write().await;
                match board.tasks.get_mut(&task_id) {
                    None => Err(Error::TaskNotFound(task_id)),
                    Some(task) if task.status.is_terminal() => Err(Error::Validation(format!(
                        "task {} is already {}",
                        task_id, task.status
                    ))),
                    Some(task) => {
                        task.workflow_id = Some(workflow_id);
                        Ok(())
                    }
                }
            };
            if let Err(e) = linked {
                let mut workflow = handle.write().await;
                if !workflow.status().is_terminal() {
                    workflow.request_cancel()?;
                }
                dlog_warn!(
                    "Workflow {} not activated: {}",
                    workflow_id.short(),
                    e
                );
                return Err(e);
            }
        }
        started?;

        self.active.write().await.push(workflow_id);
        self.workflow_wake.notify_one();

        dlog!(
            "Launched workflow {} from template {}",
            workflow_id.short(),
            template_id
        );
        Ok(workflow_id)
    }

    pub async fn workflow(&self, id: WorkflowId) -> Result<Arc<RwLock<Workflow>>> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::WorkflowNotFound(id))
    }
}

/// Settle `id` on a board the caller already holds.
///
/// Returns the updated task, or `None` when it is unknown or already
/// terminal. The task leaves the queue either way.
pub(crate) fn settle_on_board(
    board: &mut TaskBoard,
    id: TaskId,
    settlement: &Settlement,
) -> Option<Task> {
    board.queue.retain(|queued| *queued != id);
    let task = board.tasks.get_mut(&id)?;
    if task.status.is_terminal() {
        dlog_warn!(
            "Task {} already {}; ignoring {:?}",
            id.short(),
            task.status,
            settlement.event_type()
        );
        return None;
    }
    match settlement {
        Settlement::Completed(result) => task.complete(result.clone()),
        Settlement::Failed(error) => task.fail(error.clone()),
        Settlement::Cancelled => task.cancel(),
    }
    Some(task.clone())
}

/// Entry point for submitting work and querying its progress.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator with the feature template registered and no
    /// agents.
    pub fn new(config: Config) -> Self {
        let events = EventBus::with_max_history(config.effective_max_history());
        let mut templates = HashMap::new();
        let feature = feature_template();
        templates.insert(feature.template_id.clone(), feature);

        Self {
            shared: Arc::new(Shared {
                config,
                events,
                registry: Arc::new(RwLock::new(AgentRegistry::new())),
                tasks: RwLock::new(TaskBoard::default()),
                workflows: RwLock::new(HashMap::new()),
                active: RwLock::new(Vec::new()),
                templates: RwLock::new(templates),
                task_wake: Notify::new(),
                workflow_wake: Notify::new(),
                task_settled: Notify::new(),
            }),
        }
    }

    /// Create an orchestrator staffed with the built-in agents.
    pub async fn with_builtin_agents(config: Config) -> Self {
        let orchestrator = Self::new(config);
        register_builtin_agents(&mut *orchestrator.shared.registry.write().await);
        orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn registry(&self) -> Arc<RwLock<AgentRegistry>> {
        self.shared.registry.clone()
    }

    pub async fn register_agent(&self, factory: Arc<dyn AgentFactory>) {
        self.shared
            .registry
            .write()
            .await
            .register_agent_class(factory);
    }

    /// Validate and register a template, replacing any with the same id.
    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        dlog_debug!("Registered template {}", template.template_id);
        self.shared
            .templates
            .write()
            .await
            .insert(template.template_id.clone(), template);
        Ok(())
    }

    pub async fn template(&self, template_id: &str) -> Result<WorkflowTemplate> {
        self.shared
            .templates
            .read()
            .await
            .get(template_id)
            .cloned()
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))
    }

    /// Validate and enqueue a task.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId> {
        let task = Task::from_submission(submission)?;
        let id = task.id;
        {
            let mut board = self.shared.tasks.write().await;
            board.tasks.insert(id, task.clone());
            board.queue.push_back(id);
        }

        dlog!("Submitted task {} ({}): {}", id.short(), task.task_type, task.title);
        self.shared.task_event(
            EventType::TaskCreated,
            &task,
            data([
                ("task_type", json!(task.task_type)),
                ("priority", json!(task.priority)),
            ]),
        );
        self.shared.task_wake.notify_one();
        Ok(id)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.shared
            .tasks
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(Error::TaskNotFound(id))
    }

    /// Tasks in submission order, optionally filtered by status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .shared
            .tasks
            .read()
            .await
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.submitted_at);
        tasks
    }

    /// Ids still waiting in the queue, head first.
    pub async fn queued_task_ids(&self) -> Vec<TaskId> {
        self.shared.tasks.read().await.queue.iter().copied().collect()
    }

    /// Cancel a task.
    ///
    /// A task without a workflow is cancelled at once and leaves the queue.
    /// A task driven by a workflow cancels that workflow; steps already
    /// running are not interrupted.
    pub async fn cancel_task(&self, id: TaskId) -> Result<Cancellation> {
        // Decide and, when no workflow is involved, settle in one critical
        // section so the TaskProcessor cannot launch in between.
        let linked = {
            let mut board = self.shared.tasks.write().await;
            let task = board.tasks.get(&id).ok_or(Error::TaskNotFound(id))?;
            if task.status.is_terminal() {
                return Err(Error::Validation(format!(
                    "task {} is already {}",
                    id, task.status
                )));
            }
            let (status, workflow_id) = (task.status, task.workflow_id);
            match workflow_id {
                Some(workflow_id) if status == TaskStatus::InProgress => Some(workflow_id),
                _ => {
                    let settled = settle_on_board(&mut board, id, &Settlement::Cancelled);
                    drop(board);
                    if let Some(task) = settled {
                        self.shared
                            .announce_settlement(&task, &Settlement::Cancelled);
                    }
                    None
                }
            }
        };
        let Some(workflow_id) = linked else {
            return Ok(Cancellation::Cancelled);
        };

        let workflow = self.shared.workflow(workflow_id).await?;
        workflow.write().await.request_cancel()?;
        dlog!(
            "Cancellation requested for task {} via workflow {}",
            id.short(),
            workflow_id.short()
        );
        self.shared.workflow_wake.notify_one();
        Ok(Cancellation::Requested)
    }

    /// Wait until a task reaches a terminal status.
    pub async fn wait_for_task(&self, id: TaskId, limit: Duration) -> Result<Task> {
        let deadline = Instant::now() + limit;
        loop {
            let settled = self.shared.task_settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let task = self.get_task(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return Err(Error::Timeout(limit));
            }
        }
    }

    /// Start a standalone workflow from a registered template.
    pub async fn start_workflow(
        &self,
        template_id: &str,
        params: Map<String, Value>,
    ) -> Result<WorkflowId> {
        let context = params.clone();
        self.shared
            .launch_workflow(template_id, &params, context, None)
            .await
    }

    pub async fn workflow_status(&self, id: WorkflowId) -> Result<WorkflowSnapshot> {
        Ok(self.shared.workflow(id).await?.read().await.snapshot())
    }

    /// Workflow summaries, oldest first, optionally filtered by status.
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowSummary> {
        let handles: Vec<Arc<RwLock<Workflow>>> =
            self.shared.workflows.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let workflow = handle.read().await;
            if status.is_none_or(|s| workflow.status() == s) {
                summaries.push(workflow.summary());
            }
        }
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    pub async fn pause_workflow(&self, id: WorkflowId) -> Result<()> {
        self.shared.workflow(id).await?.write().await.pause()
    }

    pub async fn resume_workflow(&self, id: WorkflowId) -> Result<()> {
        self.shared.workflow(id).await?.write().await.start()?;
        self.shared.workflow_wake.notify_one();
        Ok(())
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn event_history(&self, filter: Option<&[EventType]>, limit: usize) -> Vec<Event> {
        self.shared.events.get_history(filter, limit)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("events", &self.shared.events)
            .finish_non_exhaustive()
    }
}
