//! Agent dispatch: resolve an agent, run a task on it, report agent events.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::agents::{AgentRegistry, AgentTask};
use crate::events::{data, Event, EventBus, EventType};
use crate::util::with_optional_timeout;
use crate::{dlog_debug, dlog_error, Error, Result};

/// Runs agent tasks through the registry's live instances.
///
/// The agent call runs on its own tokio task, so a panicking agent surfaces
/// as [`Error::TaskJoin`] instead of tearing down the caller.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<AgentRegistry>>,
    events: EventBus,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<AgentRegistry>>,
        events: EventBus,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            events,
            timeout,
        }
    }

    fn emit(&self, event_type: EventType, task: &AgentTask, extra: Option<(&str, Value)>) {
        let mut fields = data([("task_id", json!(task.id))]);
        if let Some(step_id) = &task.step_id {
            fields.insert("step_id".to_string(), json!(step_id));
        }
        if let Some(workflow_id) = task.workflow_id {
            fields.insert("workflow_id".to_string(), json!(workflow_id.to_string()));
        }
        if let Some((key, value)) = extra {
            fields.insert(key.to_string(), value);
        }
        self.events
            .publish(Event::agent(event_type, &task.agent_type, fields));
    }

    /// Run `task` on the live agent for its type, creating it on first use.
    pub async fn dispatch(&self, task: AgentTask) -> Result<Value> {
        let agent = {
            let mut registry = self.registry.write().await;
            registry.get_or_create(&task.agent_type)
        };
        let agent = match agent {
            Ok(agent) => agent,
            Err(e) => {
                dlog_error!("Dispatcher: no agent for {}: {}", task.agent_type, e);
                self.emit(EventType::AgentFailed, &task, Some(("error", json!(e.to_string()))));
                return Err(e);
            }
        };

        self.emit(EventType::AgentAssigned, &task, Some(("agent_name", json!(agent.name()))));
        self.emit(EventType::AgentStartedWork, &task, None);
        dlog_debug!(
            "Dispatcher: {} -> {} ({:?})",
            task.id,
            task.agent_type,
            task.action()
        );

        let sent = task.clone();
        let mut job = tokio::spawn(async move { agent.process_task(task).await });
        let outcome = with_optional_timeout(self.timeout, async {
            (&mut job).await.map_err(|e| Error::TaskJoin(e.to_string()))?
        })
        .await;
        if matches!(outcome, Err(Error::Timeout(_))) {
            // Nothing awaits the result any more.
            job.abort();
        }

        match &outcome {
            Ok(_) => self.emit(EventType::AgentCompletedWork, &sent, None),
            Err(e) => {
                dlog_error!("Dispatcher: {} failed on {}: {}", sent.id, sent.agent_type, e);
                self.emit(EventType::AgentFailed, &sent, Some(("error", json!(e.to_string()))));
            }
        }
        outcome
    }
}
