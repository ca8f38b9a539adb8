//! Core data model: submitted tasks and step dependency graphs.

pub mod dag;
pub mod task;

pub use dag::StepGraph;
pub use task::{Task, TaskId, TaskPriority, TaskStatus, TaskSubmission, TaskType};
