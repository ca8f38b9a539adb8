//! WorkflowProcessor: advances every active workflow's frontier.
//!
//! Each pass reconciles active workflows, settles the task linked to any
//! workflow that reached a terminal status, and spawns every ready step
//! onto a JoinSet. Steps of one workflow run concurrently; the workflow
//! lock is only held to begin and to finish a step, never across the
//! agent call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::dispatch::Dispatcher;
use super::orchestrator::{Settlement, Shared};
use crate::workflow::{Workflow, WorkflowId, WorkflowStatus};
use crate::{dlog, dlog_debug, dlog_error, dlog_trace};

/// Outcome of one workflow pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub steps_started: usize,
    pub workflows_finished: usize,
}

pub struct WorkflowProcessor {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    in_flight: JoinSet<()>,
}

impl WorkflowProcessor {
    pub(crate) fn new(shared: Arc<Shared>, dispatcher: Dispatcher) -> Self {
        Self {
            shared,
            dispatcher,
            in_flight: JoinSet::new(),
        }
    }

    /// Steps currently running on agents.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// One pass over the active workflows, starting every ready step.
    pub async fn tick(&mut self) -> PassReport {
        self.reap();
        self.pass(true).await
    }

    /// Wait for every in-flight step, then settle what finished.
    pub async fn drain(&mut self) -> PassReport {
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                dlog_error!("WorkflowProcessor: step job failed: {}", e);
            }
        }
        self.pass(false).await
    }

    fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                dlog_error!("WorkflowProcessor: step job failed: {}", e);
            }
        }
    }

    async fn pass(&mut self, start_steps: bool) -> PassReport {
        let mut report = PassReport::default();
        let active: Vec<WorkflowId> = self.shared.active.read().await.clone();
        dlog_trace!("WorkflowProcessor: pass over {} workflow(s)", active.len());

        for workflow_id in active {
            let handle = match self.shared.workflow(workflow_id).await {
                Ok(handle) => handle,
                Err(e) => {
                    dlog_error!("WorkflowProcessor: {}", e);
                    self.deactivate(workflow_id).await;
                    continue;
                }
            };

            let ready = {
                let mut workflow = handle.write().await;
                let status = workflow.reconcile();
                if status.is_terminal() {
                    let outcome = Finished::from_workflow(&workflow);
                    drop(workflow);
                    self.finish(workflow_id, outcome).await;
                    report.workflows_finished += 1;
                    continue;
                }
                if !start_steps || status != WorkflowStatus::Running {
                    continue;
                }
                begin_ready_steps(&mut workflow)
            };

            for (step_id, task) in ready {
                report.steps_started += 1;
                let dispatcher = self.dispatcher.clone();
                let handle = handle.clone();
                let shared = self.shared.clone();
                self.in_flight.spawn(async move {
                    let outcome = dispatcher.dispatch(task).await;
                    {
                        let mut workflow = handle.write().await;
                        if let Err(e) = workflow.finish_step(&step_id, outcome) {
                            dlog_error!("WorkflowProcessor: finishing {}: {}", step_id, e);
                        }
                        workflow.reconcile();
                    }
                    shared.workflow_wake.notify_one();
                });
            }
        }
        report
    }

    async fn deactivate(&self, workflow_id: WorkflowId) {
        self.shared
            .active
            .write()
            .await
            .retain(|id| *id != workflow_id);
    }

    async fn finish(&self, workflow_id: WorkflowId, outcome: Finished) {
        self.deactivate(workflow_id).await;
        dlog!(
            "Workflow {} finished as {}",
            workflow_id.short(),
            outcome.status
        );

        let Some(task_id) = outcome.task_id else {
            return;
        };
        let settlement = match outcome.status {
            WorkflowStatus::Completed => Settlement::Completed(Some(outcome.context)),
            WorkflowStatus::Cancelled => Settlement::Cancelled,
            _ => Settlement::Failed(outcome.error),
        };
        if !self.shared.settle_task(task_id, settlement).await {
            dlog_debug!(
                "Task {} was already settled when workflow {} finished",
                task_id.short(),
                workflow_id.short()
            );
        }
    }

    /// Advance workflows whenever woken or on the rescan interval, until
    /// `cancel` fires. In-flight steps are awaited before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let shared = self.shared.clone();
        let mut rescan = tokio::time::interval(shared.config.effective_rescan_interval());
        dlog_debug!("WorkflowProcessor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    dlog_debug!("WorkflowProcessor cancelled");
                    break;
                }
                _ = shared.workflow_wake.notified() => {}
                _ = rescan.tick() => {}
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(report) if report != PassReport::default() => {
                    dlog_trace!("WorkflowProcessor: {:?}", report);
                }
                Ok(_) => {}
                Err(_) => dlog_error!("WorkflowProcessor: pass panicked; continuing"),
            }
        }

        let report = self.drain().await;
        dlog_debug!("WorkflowProcessor drained: {:?}", report);
    }
}

/// What a terminal workflow hands back to its task.
struct Finished {
    status: WorkflowStatus,
    task_id: Option<crate::core::task::TaskId>,
    context: Value,
    error: String,
}

impl Finished {
    fn from_workflow(workflow: &Workflow) -> Self {
        let failed: Vec<&str> = workflow
            .failed_step_ids()
            .iter()
            .map(String::as_str)
            .collect();
        let error = if failed.is_empty() {
            format!("workflow {} made no progress", workflow.id())
        } else {
            let details: Vec<String> = failed
                .iter()
                .map(|id| {
                    let reason = workflow
                        .step(id)
                        .and_then(|s| s.error.as_deref())
                        .unwrap_or("unknown error");
                    format!("{}: {}", id, reason)
                })
                .collect();
            format!("workflow steps failed: {}", details.join("; "))
        };
        Self {
            status: workflow.status(),
            task_id: workflow.task_id(),
            context: Value::Object(workflow.context().clone()),
            error,
        }
    }
}

fn begin_ready_steps(workflow: &mut Workflow) -> Vec<(String, crate::agents::AgentTask)> {
    let mut started = Vec::new();
    for step_id in workflow.ready_step_ids() {
        match workflow.begin_step(&step_id) {
            Ok(task) => started.push((step_id, task)),
            Err(e) => dlog_error!("WorkflowProcessor: cannot begin {}: {}", step_id, e),
        }
    }
    started
}
