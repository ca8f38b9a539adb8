//! Workflow engine: step DAGs, their runtime, and reusable templates.
//!
//! A [`WorkflowTemplate`] is instantiated into a [`Workflow`], which owns its
//! [`WorkflowStep`]s and derives its status from theirs.

pub mod engine;
pub mod step;
pub mod template;
mod types;

pub use engine::{result_key, Workflow, WorkflowSnapshot, WorkflowSummary};
pub use step::{StepBlueprint, WorkflowStep};
pub use template::{feature_template, WorkflowTemplate, FEATURE_TEMPLATE_ID};
pub use types::{DependentFailurePolicy, StepStatus, WorkflowId, WorkflowStatus};
