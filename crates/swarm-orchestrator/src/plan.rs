//! Validation of planner output
//!
//! Nothing the planning capability returns is trusted. A plan that fails any
//! check is fatal to the run before a single worker starts.

use serde_json::Value;
use std::collections::HashSet;
use swarm_core::{is_safe_identifier, Plan, Result, SwarmError};
use swarm_vcs::INTEGRATION_WORKER;
use tracing::warn;

/// Parse and check a raw plan
///
/// A missing top-level objective falls back to the run objective. Plans with
/// more than `max_tasks` tasks are truncated, dropping coupling hints that
/// pointed at removed tasks.
pub fn validate_plan(raw: Value, objective: &str, max_tasks: usize) -> Result<Plan> {
    let mut raw = match raw {
        Value::Object(map) => map,
        other => {
            return Err(SwarmError::Validation(format!(
                "plan must be a JSON object, got {}",
                json_type(&other)
            )))
        }
    };
    let has_objective = raw
        .get("objective")
        .and_then(Value::as_str)
        .map_or(false, |s| !s.trim().is_empty());
    if !has_objective {
        raw.insert("objective".to_string(), Value::String(objective.to_string()));
    }

    let mut plan: Plan = serde_json::from_value(Value::Object(raw))
        .map_err(|e| SwarmError::Validation(format!("malformed plan: {}", e)))?;

    if plan.tasks.is_empty() {
        return Err(SwarmError::Validation("plan contains no tasks".to_string()));
    }

    if max_tasks > 0 && plan.tasks.len() > max_tasks {
        warn!(
            "Plan has {} tasks; keeping the first {}",
            plan.tasks.len(),
            max_tasks
        );
        plan.tasks.truncate(max_tasks);
        let kept: HashSet<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        for task in &mut plan.tasks {
            task.coupled_with.retain(|id| kept.contains(id));
        }
    }

    let mut seen = HashSet::new();
    for task in &plan.tasks {
        if !is_safe_identifier(&task.id) {
            return Err(SwarmError::Validation(format!(
                "task id {:?} is not a valid identifier",
                task.id
            )));
        }
        if task.id == INTEGRATION_WORKER {
            return Err(SwarmError::Validation(format!(
                "task id {:?} is reserved",
                task.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(SwarmError::Validation(format!(
                "duplicate task id {:?}",
                task.id
            )));
        }
        if task.objective.trim().is_empty() {
            return Err(SwarmError::Validation(format!(
                "task {} has an empty objective",
                task.id
            )));
        }
    }

    for task in &plan.tasks {
        if let Some(unknown) = task.coupled_with.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(SwarmError::Validation(format!(
                "task {} is coupled to unknown task {:?}",
                task.id, unknown
            )));
        }
    }

    Ok(plan)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str) -> Value {
        json!({ "id": id, "objective": format!("do {}", id) })
    }

    #[test]
    fn test_valid_plan() {
        let plan = validate_plan(
            json!({
                "reasoning": "split by layer",
                "tasks": [
                    { "id": "api", "objective": "endpoints", "interfaces": ["LoginRequest"] },
                    { "id": "ui", "objective": "forms", "coupled_with": ["api"] }
                ],
                "verify_command": "cargo test"
            }),
            "add login",
            8,
        )
        .unwrap();

        assert_eq!(plan.objective, "add login");
        assert_eq!(plan.tasks.len(), 2);
        assert!(plan.tasks[1].coupled_with.contains("api"));
        assert_eq!(plan.verify_command.as_deref(), Some("cargo test"));
    }

    #[test]
    fn test_rejects_malformed_plans() {
        let cases = vec![
            json!([]),
            json!({ "tasks": [] }),
            json!({ "tasks": [{ "id": "a" }] }),
            json!({ "tasks": [task("a"), task("a")] }),
            json!({ "tasks": [task("../escape")] }),
            json!({ "tasks": [task("integration")] }),
            json!({ "tasks": [{ "id": "a", "objective": "  " }] }),
            json!({ "tasks": [{ "id": "a", "objective": "x", "coupled_with": ["ghost"] }] }),
        ];
        for raw in cases {
            let err = validate_plan(raw.clone(), "o", 8).unwrap_err();
            assert!(
                matches!(err, SwarmError::Validation(_)),
                "expected validation error for {}",
                raw
            );
        }
    }

    #[test]
    fn test_truncates_to_max_tasks() {
        let plan = validate_plan(
            json!({
                "objective": "planner's own words",
                "tasks": [
                    task("a"),
                    { "id": "b", "objective": "b", "coupled_with": ["a", "c"] },
                    { "id": "c", "objective": "c" }
                ]
            }),
            "o",
            2,
        )
        .unwrap();

        assert_eq!(plan.objective, "planner's own words");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].coupled_with.len(), 1);
        assert!(plan.tasks[1].coupled_with.contains("a"));
    }
}
