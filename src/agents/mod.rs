//! Agent capability interface.
//!
//! An agent is a pluggable worker resolved by a string type key. The
//! orchestrator only ever talks to agents through [`Agent::process_task`].

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::WorkflowId;
use crate::Result;

pub use registry::{AgentFactory, AgentRegistry, FnFactory};

/// A concrete unit of work handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub agent_type: String,
    pub workflow_id: Option<WorkflowId>,
    pub step_id: Option<String>,
    /// Instructions for the agent; `type` names the action to perform.
    pub payload: Map<String, Value>,
    /// Snapshot of the workflow context when the task was built.
    pub context: Map<String, Value>,
}

impl AgentTask {
    pub fn new(agent_type: &str, payload: Map<String, Value>) -> Self {
        Self {
            id: format!("task_{}", Uuid::new_v4()),
            agent_type: agent_type.to_string(),
            workflow_id: None,
            step_id: None,
            payload,
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn for_step(mut self, workflow_id: WorkflowId, step_id: &str) -> Self {
        self.workflow_id = Some(workflow_id);
        self.step_id = Some(step_id.to_string());
        self
    }

    /// The action named by the payload's `type` field.
    pub fn action(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// A worker that performs tasks of one agent type.
///
/// One instance serves every call for its type, including concurrent calls
/// from sibling steps, so implementations must be safe to share.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry key, e.g. `developer`.
    fn agent_type(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Prepare the agent. Returning false aborts its creation.
    fn initialize(&self) -> bool {
        true
    }

    /// Release the agent's resources. Returning false keeps the registry intact.
    fn shutdown(&self) -> bool {
        true
    }

    /// Perform `task`. An `Err` is recorded as the step or task failure.
    async fn process_task(&self, task: AgentTask) -> Result<Value>;
}
