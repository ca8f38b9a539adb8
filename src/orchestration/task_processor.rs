//! TaskProcessor: drains the task queue one head at a time.
//!
//! Feature tasks are expanded into a workflow and handed to the
//! WorkflowProcessor. Every other task is dispatched directly to the agent
//! its type maps to.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use super::orchestrator::{Settlement, Shared};
use crate::agents::AgentTask;
use crate::core::task::{Task, TaskStatus};
use crate::events::{data, EventType};
use crate::{dlog, dlog_debug, dlog_error, dlog_trace, dlog_warn};

pub struct TaskProcessor {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
}

impl TaskProcessor {
    pub(crate) fn new(shared: Arc<Shared>, dispatcher: Dispatcher) -> Self {
        Self { shared, dispatcher }
    }

    /// Process the head of the queue.
    ///
    /// Returns false when the queue was empty.
    pub async fn tick(&self) -> bool {
        let head = {
            let mut board = self.shared.tasks.write().await;
            let Some(id) = board.queue.front().copied() else {
                return false;
            };
            match board.tasks.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Submitted => {
                    task.start();
                    Some(task.clone())
                }
                _ => {
                    // Settled while queued; nothing to run.
                    board.queue.pop_front();
                    None
                }
            }
        };
        let Some(task) = head else {
            return true;
        };

        dlog!("Processing task {} ({})", task.id.short(), task.task_type);
        self.shared.task_event(
            EventType::TaskStarted,
            &task,
            data([("task_type", json!(task.task_type))]),
        );

        if task.is_feature() {
            self.launch_feature(&task).await;
        } else {
            self.run_direct(&task).await;
        }

        self.shared
            .tasks
            .write()
            .await
            .queue
            .retain(|queued| *queued != task.id);
        true
    }

    async fn launch_feature(&self, task: &Task) {
        let template_id = self.shared.config.effective_feature_template();
        let params = data([
            ("feature_name", json!(task.title)),
            ("feature_requirements", json!(task.description)),
        ]);
        let context = data([
            ("task_id", json!(task.id.to_string())),
            ("task", task.to_value()),
        ]);

        match self
            .shared
            .launch_workflow(template_id, &params, context, Some(task.id))
            .await
        {
            Ok(workflow_id) => {
                dlog_debug!(
                    "Task {} handed to workflow {}",
                    task.id.short(),
                    workflow_id.short()
                );
                self.shared.task_event(
                    EventType::TaskUpdated,
                    task,
                    data([("workflow_id", json!(workflow_id.to_string()))]),
                );
            }
            Err(e) => {
                dlog_error!("Task {}: could not start workflow: {}", task.id.short(), e);
                self.shared
                    .settle_task(task.id, Settlement::Failed(e.to_string()))
                    .await;
            }
        }
    }

    async fn run_direct(&self, task: &Task) {
        let mut payload = Map::new();
        payload.insert("type".to_string(), json!(task.task_type.default_action()));
        payload.insert("title".to_string(), json!(task.title));
        payload.insert("description".to_string(), json!(task.description));
        payload.insert("priority".to_string(), json!(task.priority));
        payload.insert("task_type".to_string(), json!(task.task_type));

        let agent_task = AgentTask::new(task.task_type.default_agent_type(), payload)
            .with_context(data([("task", task.to_value())]));

        let settlement = match self.dispatcher.dispatch(agent_task).await {
            Ok(result) => Settlement::Completed(Some(result)),
            Err(e) => Settlement::Failed(e.to_string()),
        };
        if !self.shared.settle_task(task.id, settlement).await {
            dlog_warn!("Task {}: result arrived after it settled", task.id.short());
        }
    }

    /// Drain the queue whenever woken, until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let idle = self.shared.config.effective_idle_interval();
        dlog_debug!("TaskProcessor started (idle interval {:?})", idle);

        loop {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match AssertUnwindSafe(self.tick()).catch_unwind().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(_) => {
                        dlog_error!("TaskProcessor: tick panicked; continuing");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    dlog_debug!("TaskProcessor cancelled");
                    break;
                }
                _ = self.shared.task_wake.notified() => {
                    dlog_trace!("TaskProcessor woken");
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }
    }
}
