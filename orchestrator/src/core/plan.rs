//! Task plans produced by the reasoning collaborator.
//!
//! A plan is accepted only if it validates against the bundled JSON Schema
//! and the materialized task passes the structural invariants. Checkpoint
//! dependencies are expressed as indices into the plan's checkpoint list
//! and become ids on materialization.

use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;

use crate::core::invariants::validate_task;
use crate::core::types::{Checkpoint, CheckpointStatus, PassCriterion, Task, TaskStatus, Timestamp, new_id};
use crate::error::{Error, Result};

const PLAN_SCHEMA: &str = include_str!("../../schemas/task_plan.schema.json");

#[derive(Debug, Clone, Deserialize)]
pub struct TaskPlan {
    pub task: PlannedTask,
    pub checkpoints: Vec<PlannedCheckpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedCheckpoint {
    pub name: String,
    pub objective: String,
    pub instructions: Vec<String>,
    pub pass_criteria: Vec<PlannedCriterion>,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PlannedCriterion {
    Text(String),
    Detailed(PassCriterion),
}

impl From<PlannedCriterion> for PassCriterion {
    fn from(value: PlannedCriterion) -> Self {
        match value {
            PlannedCriterion::Text(description) => PassCriterion::described(description),
            PlannedCriterion::Detailed(criterion) => criterion,
        }
    }
}

/// Extract, schema-check and deserialize a plan from collaborator text.
pub fn parse_plan(raw: &str) -> Result<TaskPlan> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Plan("response contains no JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| Error::Plan("response contains no complete JSON object".to_string()))?;
    let value: Value = serde_json::from_str(&raw[start..=end])
        .map_err(|err| Error::Plan(format!("invalid JSON: {err}")))?;

    validate_schema(&value)?;
    serde_json::from_value(value).map_err(|err| Error::Plan(format!("unexpected shape: {err}")))
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA)
        .map_err(|err| anyhow::anyhow!("bundled plan schema is not JSON: {err}"))?;
    let compiled = validator_for(&schema)
        .map_err(|err| anyhow::anyhow!("bundled plan schema is invalid: {err}"))?;
    if compiled.is_valid(value) {
        return Ok(());
    }
    let messages = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(Error::Plan(format!(
        "schema validation failed: {}",
        messages.join("; ")
    )))
}

/// Turn an accepted plan into a pending task and its checkpoints.
pub fn materialize(
    plan: TaskPlan,
    draft_id: &str,
    default_max_retries: u32,
    now: Timestamp,
) -> Result<(Task, Vec<Checkpoint>)> {
    let task_id = new_id("task");
    let ids: Vec<String> = plan.checkpoints.iter().map(|_| new_id("cp")).collect();

    let mut checkpoints = Vec::with_capacity(plan.checkpoints.len());
    for (position, planned) in plan.checkpoints.into_iter().enumerate() {
        let mut dependencies = Vec::new();
        for index in planned.depends_on {
            let id = ids.get(index).ok_or_else(|| {
                Error::Plan(format!(
                    "checkpoint {} depends on unknown checkpoint {}",
                    position, index
                ))
            })?;
            dependencies.push(id.clone());
        }
        checkpoints.push(Checkpoint {
            id: ids[position].clone(),
            task_id: task_id.clone(),
            name: planned.name,
            objective: planned.objective,
            instructions: planned.instructions,
            pass_criteria: planned.pass_criteria.into_iter().map(Into::into).collect(),
            status: CheckpointStatus::Pending,
            retry_count: 0,
            max_retries: planned.max_retries.unwrap_or(default_max_retries),
            blocking: planned.blocking,
            parallelizable: planned.parallelizable,
            dependencies,
            needs_escalation: false,
            ticket_id: None,
            logs: Vec::new(),
            updated_at: now,
        });
    }

    let task = Task {
        id: task_id,
        draft_id: draft_id.to_string(),
        name: plan.task.name,
        objective: plan.task.objective,
        acceptance_criteria: plan.task.acceptance_criteria,
        checkpoints: ids,
        status: TaskStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    let violations = validate_task(&task, &checkpoints);
    if !violations.is_empty() {
        return Err(Error::Plan(violations.join("; ")));
    }
    Ok((task, checkpoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const PLAN: &str = r#"Plan below.
{
  "task": {"name": "Add parser", "objective": "Parse configs", "acceptance_criteria": ["parses toml"]},
  "checkpoints": [
    {"name": "Scaffold", "objective": "Create module", "instructions": ["create src/parser.rs"],
     "pass_criteria": ["file src/parser.rs exists"]},
    {"name": "Tests", "objective": "Cover parser", "instructions": ["write tests", "run them"],
     "pass_criteria": [{"description": "tests pass", "command": "cargo test"}],
     "depends_on": [0], "blocking": false}
  ]
}"#;

    #[test]
    fn parses_and_materializes_plan() {
        let plan = parse_plan(PLAN).expect("plan");
        let (task, checkpoints) = materialize(plan, "draft-1", 3, Utc::now()).expect("materialize");
        assert_eq!(task.checkpoints.len(), 2);
        assert_eq!(task.draft_id, "draft-1");
        assert_eq!(checkpoints[1].dependencies, vec![checkpoints[0].id.clone()]);
        assert!(!checkpoints[1].blocking);
        assert_eq!(checkpoints[0].max_retries, 3);
        assert_eq!(
            checkpoints[1].pass_criteria[0].command.as_deref(),
            Some("cargo test")
        );
    }

    #[test]
    fn schema_violation_is_a_plan_error() {
        let err = parse_plan(r#"{"task": {"name": "x", "objective": "y"}, "checkpoints": []}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
    }

    #[test]
    fn forward_dependency_is_rejected() {
        let raw = r#"{"task": {"name": "x", "objective": "y"}, "checkpoints": [
            {"name": "a", "objective": "a", "instructions": ["a"], "pass_criteria": ["a done"], "depends_on": [1]},
            {"name": "b", "objective": "b", "instructions": ["b"], "pass_criteria": ["b done"]}
        ]}"#;
        let plan = parse_plan(raw).expect("schema-valid");
        let err = materialize(plan, "draft-1", 3, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("does not precede"));
    }

    #[test]
    fn prose_without_json_is_rejected() {
        assert!(matches!(parse_plan("no plan today"), Err(Error::Plan(_))));
    }
}
