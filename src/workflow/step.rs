//! Workflow steps and the blueprints they are built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::StepStatus;

/// Template-side description of a step.
///
/// String fields may contain `{placeholder}` tokens that are substituted
/// when a workflow is instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBlueprint {
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Task payload handed to the agent; `type` names the agent action.
    #[serde(default)]
    pub task: Map<String, Value>,
}

impl StepBlueprint {
    pub fn new(step_id: &str, name: &str, agent_type: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            agent_type: agent_type.to_string(),
            depends_on: Vec::new(),
            task: Map::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn task(mut self, task: Value) -> Self {
        if let Value::Object(map) = task {
            self.task = map;
        }
        self
    }
}

/// One node of a running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: String,
    pub name: String,
    pub description: String,
    pub agent_type: String,
    pub depends_on: Vec<String>,
    pub task_blueprint: Map<String, Value>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Id of the agent task built for the most recent run.
    pub agent_task_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn from_blueprint(blueprint: StepBlueprint) -> Self {
        Self {
            step_id: blueprint.step_id,
            name: blueprint.name,
            description: blueprint.description,
            agent_type: blueprint.agent_type,
            depends_on: blueprint.depends_on,
            task_blueprint: blueprint.task,
            status: StepStatus::Pending,
            result: None,
            error: None,
            agent_task_id: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }

    pub(crate) fn mark_started(&mut self, agent_task_id: String) {
        self.status = StepStatus::InProgress;
        self.agent_task_id = Some(agent_task_id);
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, result: Value) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.ended_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    pub(crate) fn mark_skipped(&mut self, reason: String) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason);
        self.ended_at = Some(Utc::now());
    }
}
