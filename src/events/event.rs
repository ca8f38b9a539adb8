//! Event envelope and the catalogue of event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every kind of event the orchestrator publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,

    AgentAssigned,
    AgentStartedWork,
    AgentCompletedWork,
    AgentFailed,

    WorkflowCreated,
    WorkflowUpdated,
    WorkflowStepStarted,
    WorkflowStepCompleted,
    WorkflowStepFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,

    SystemError,
    SystemInfo,
}

/// Coarse grouping of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Task,
    Agent,
    Workflow,
    System,
}

impl EventType {
    pub const ALL: [EventType; 20] = [
        EventType::TaskCreated,
        EventType::TaskUpdated,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskCancelled,
        EventType::AgentAssigned,
        EventType::AgentStartedWork,
        EventType::AgentCompletedWork,
        EventType::AgentFailed,
        EventType::WorkflowCreated,
        EventType::WorkflowUpdated,
        EventType::WorkflowStepStarted,
        EventType::WorkflowStepCompleted,
        EventType::WorkflowStepFailed,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::WorkflowCancelled,
        EventType::SystemError,
        EventType::SystemInfo,
    ];

    pub fn category(&self) -> EventCategory {
        use EventType::*;
        match self {
            TaskCreated | TaskUpdated | TaskStarted | TaskCompleted | TaskFailed
            | TaskCancelled => EventCategory::Task,
            AgentAssigned | AgentStartedWork | AgentCompletedWork | AgentFailed => {
                EventCategory::Agent
            }
            WorkflowCreated | WorkflowUpdated | WorkflowStepStarted | WorkflowStepCompleted
            | WorkflowStepFailed | WorkflowCompleted | WorkflowFailed | WorkflowCancelled => {
                EventCategory::Workflow
            }
            SystemError | SystemInfo => EventCategory::System,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use EventType::*;
        match self {
            TaskCreated => "task_created",
            TaskUpdated => "task_updated",
            TaskStarted => "task_started",
            TaskCompleted => "task_completed",
            TaskFailed => "task_failed",
            TaskCancelled => "task_cancelled",
            AgentAssigned => "agent_assigned",
            AgentStartedWork => "agent_started_work",
            AgentCompletedWork => "agent_completed_work",
            AgentFailed => "agent_failed",
            WorkflowCreated => "workflow_created",
            WorkflowUpdated => "workflow_updated",
            WorkflowStepStarted => "workflow_step_started",
            WorkflowStepCompleted => "workflow_step_completed",
            WorkflowStepFailed => "workflow_step_failed",
            WorkflowCompleted => "workflow_completed",
            WorkflowFailed => "workflow_failed",
            WorkflowCancelled => "workflow_cancelled",
            SystemError => "system_error",
            SystemInfo => "system_info",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| crate::Error::Validation(format!("unknown event type: {}", s)))
    }
}

/// An immutable record of something that happened.
///
/// Task, agent and workflow events carry the emitter's id inside `data`
/// under `task_id`, `agent_type` or `workflow_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: EventType,
    source: String,
    data: Map<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, source: &str, data: Map<String, Value>) -> Self {
        Self {
            event_type,
            source: source.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn task(event_type: EventType, task_id: &str, data: Map<String, Value>) -> Self {
        Self::with_id(event_type, "task", "task_id", task_id, data)
    }

    pub fn agent(event_type: EventType, agent_type: &str, data: Map<String, Value>) -> Self {
        Self::with_id(event_type, "agent", "agent_type", agent_type, data)
    }

    pub fn workflow(event_type: EventType, workflow_id: &str, data: Map<String, Value>) -> Self {
        Self::with_id(event_type, "workflow", "workflow_id", workflow_id, data)
    }

    pub fn system(event_type: EventType, message: &str) -> Self {
        let mut data = Map::new();
        data.insert("message".to_string(), Value::String(message.to_string()));
        Self::new(event_type, "system", data)
    }

    fn with_id(
        event_type: EventType,
        source: &str,
        key: &str,
        id: &str,
        mut data: Map<String, Value>,
    ) -> Self {
        data.insert(key.to_string(), Value::String(id.to_string()));
        Self::new(event_type, source, data)
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Build a JSON object from key/value pairs.
pub fn data<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
