//! Reusable, parameterizable workflow blueprints.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::engine::Workflow;
use super::step::{StepBlueprint, WorkflowStep};
use crate::core::dag::StepGraph;
use crate::{dlog_debug, Result};

/// Id of the built-in template used for feature tasks.
pub const FEATURE_TEMPLATE_ID: &str = "feature_implementation";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// Replace every `{key}` in `text` with the matching parameter.
///
/// String parameters are inserted as-is, other values in their JSON form.
/// Unknown keys are left untouched. Substituted text is not rescanned.
pub fn substitute(text: &str, params: &Map<String, Value>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures| match params.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Apply [`substitute`] to every string inside `value`, including nested
/// objects and arrays. Object keys are left as they are.
pub fn substitute_value(value: &Value, params: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, params)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, params)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepBlueprint>,
}

impl WorkflowTemplate {
    pub fn new(
        template_id: &str,
        name: &str,
        description: &str,
        steps: Vec<StepBlueprint>,
    ) -> Self {
        Self {
            template_id: template_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            steps,
        }
    }

    /// Parse and validate a template written in TOML.
    ///
    /// ```toml
    /// template_id = "review"
    /// name = "Review"
    ///
    /// [[steps]]
    /// step_id = "analyze"
    /// name = "Analyze {target}"
    /// agent_type = "code_analyst"
    /// task = { type = "analyze" }
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let template: Self = toml::from_str(source)?;
        template.validate()?;
        Ok(template)
    }

    /// Reject templates whose step graph can never run to completion.
    ///
    /// Checks for duplicate step ids, unknown dependencies, cycles and the
    /// absence of a step without dependencies.
    pub fn validate(&self) -> Result<()> {
        StepGraph::build(self.steps.iter().map(|s| {
            (
                s.step_id.as_str(),
                s.depends_on.iter().map(String::as_str),
            )
        }))?
        .validate()
    }

    /// Instantiate a fresh workflow with a new id.
    ///
    /// Every string in every blueprint is passed through [`substitute`],
    /// step ids and dependency lists included.
    pub fn create_workflow(
        &self,
        params: &Map<String, Value>,
        context: Map<String, Value>,
    ) -> Result<Workflow> {
        let steps = self
            .steps
            .iter()
            .map(|bp| -> Result<WorkflowStep> {
                let concrete = substitute_value(&serde_json::to_value(bp)?, params);
                let bp: StepBlueprint = serde_json::from_value(concrete)?;
                Ok(WorkflowStep::from_blueprint(bp))
            })
            .collect::<Result<Vec<_>>>()?;

        let workflow = Workflow::new(&self.name, &self.description, steps)?.with_context(context);
        dlog_debug!(
            "Template {} instantiated as workflow {}",
            self.template_id,
            workflow.id().short()
        );
        Ok(workflow)
    }
}

/// The four-step plan/analyze/implement/test template used for features.
///
/// Expects `feature_name` and `feature_requirements` parameters.
pub fn feature_template() -> WorkflowTemplate {
    WorkflowTemplate::new(
        FEATURE_TEMPLATE_ID,
        "Feature Implementation Workflow",
        "Workflow for implementing a new feature",
        vec![
            StepBlueprint::new("planning", "Feature Planning", "project_manager")
                .description("Plan the feature implementation")
                .task(json!({
                    "type": "plan",
                    "description": "Plan the implementation of {feature_name}",
                    "requirements": "{feature_requirements}",
                })),
            StepBlueprint::new("code_analysis", "Code Analysis", "code_analyst")
                .description("Analyze the codebase to find where the feature belongs")
                .depends_on(&["planning"])
                .task(json!({
                    "type": "analyze",
                    "code_context": {
                        "description": "Analyze where to implement {feature_name}",
                        "files": {},
                    },
                    "analysis_request": "Identify the best place to implement {feature_name}",
                })),
            StepBlueprint::new("implementation", "Feature Implementation", "developer")
                .description("Implement the feature")
                .depends_on(&["planning", "code_analysis"])
                .task(json!({
                    "type": "implement",
                    "description": "Implement {feature_name}",
                    "requirements": "{feature_requirements}",
                    "code_context": {},
                })),
            StepBlueprint::new("testing", "Feature Testing", "qa_tester")
                .description("Test the implemented feature")
                .depends_on(&["implementation"])
                .task(json!({
                    "type": "design_tests",
                    "description": "Design tests for {feature_name}",
                    "requirements": "{feature_requirements}",
                    "code": "",
                })),
        ],
    )
}
