use thiserror::Error;

use crate::core::task::TaskId;
use crate::workflow::WorkflowId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    #[error("Agent type not found: {0}")]
    AgentTypeNotFound(String),

    #[error("Step {step} not found in workflow {workflow}")]
    StepNotFound { workflow: WorkflowId, step: String },

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Cannot execute step {step}: dependency {dependency} not completed")]
    DependencyNotMet { step: String, dependency: String },

    #[error("Step {step} cannot start from status {status}")]
    InvalidStepState { step: String, status: String },

    #[error("Invalid workflow transition from {from} to {to}")]
    InvalidWorkflowTransition { from: String, to: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Agent initialization failed: {0}")]
    AgentInit(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// True for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TaskNotFound(_)
                | Error::WorkflowNotFound(_)
                | Error::TemplateNotFound(_)
                | Error::AgentTypeNotFound(_)
                | Error::StepNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
