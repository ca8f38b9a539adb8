//! Task data model for submitted units of work.
//!
//! A task is created on submission, queued, and then driven to a terminal
//! status either by a direct agent dispatch or by a linked workflow.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::WorkflowId;
use crate::{Error, Result};

/// Unique identifier for a submitted task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        crate::util::short_id(&self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of work a task represents.
///
/// Feature tasks are expanded into a workflow; every other kind is
/// dispatched directly to a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Analysis,
    Documentation,
    Testing,
    Security,
    Performance,
}

impl TaskType {
    /// Agent type used when the task is dispatched without a workflow.
    pub fn default_agent_type(&self) -> &'static str {
        match self {
            TaskType::Analysis => "code_analyst",
            TaskType::Testing => "qa_tester",
            _ => "project_manager",
        }
    }

    /// Action name placed in the payload of a direct dispatch.
    pub fn default_action(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analyze",
            TaskType::Testing => "design_tests",
            _ => "plan",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Feature => "feature",
            TaskType::Bugfix => "bugfix",
            TaskType::Refactor => "refactor",
            TaskType::Analysis => "analysis",
            TaskType::Documentation => "documentation",
            TaskType::Testing => "testing",
            TaskType::Security => "security",
            TaskType::Performance => "performance",
        };
        write!(f, "{}", s)
    }
}

/// Task priority, ordered from least to most urgent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
            TaskPriority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Task status in its lifecycle.
///
/// A task waiting in the queue keeps `Submitted`; queue membership is
/// what distinguishes a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Submitted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "submitted" => Ok(TaskStatus::Submitted),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::Validation(format!("unknown task status: {}", other))),
        }
    }
}

/// Fields a caller supplies when submitting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskSubmission {
    pub fn new(title: &str, description: &str, task_type: TaskType) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            task_type,
            priority: TaskPriority::default(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Reject submissions with a blank title or description.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation("description is required".to_string()));
        }
        Ok(())
    }
}

/// A submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow driving this task, set once a feature task is expanded.
    pub workflow_id: Option<WorkflowId>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    /// Build a task from a validated submission.
    pub fn from_submission(submission: TaskSubmission) -> Result<Self> {
        submission.validate()?;
        Ok(Self {
            id: TaskId::new(),
            title: submission.title,
            description: submission.description,
            task_type: submission.task_type,
            priority: submission.priority,
            status: TaskStatus::Submitted,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            workflow_id: None,
            result: None,
            error: None,
        })
    }

    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: Option<Value>) {
        self.status = TaskStatus::Completed;
        self.result = result;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_feature(&self) -> bool {
        self.task_type == TaskType::Feature
    }

    /// JSON object form, used as workflow context and agent payload.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
