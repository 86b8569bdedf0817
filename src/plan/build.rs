//! Wire payload to [`ExecutionPlan`] conversion.
//!
//! Two encodings arrive off the wire: the current list form
//! (`{workflow: {steps: [...]}}`) and the legacy keyed-map form
//! (`{triggers: {id: {...}}, jobs: {id: {...}}}`). Both map onto the same
//! typed plan; named edge conditions (`on_job_success`, `on_job_failure`,
//! `always`) become the closed [`EdgeCondition`] variants.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::model::{ConfigurationRef, Edge, EdgeCondition, ExecutionPlan, PlanOptions, Step};
use super::PlanError;
use crate::install::AdaptorSpecifier;

/// Convert a claimed wire payload into a typed plan.
pub fn build(raw: &Value) -> Result<ExecutionPlan, PlanError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| PlanError::Shape("plan payload must be an object".to_string()))?;

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let steps = if let Some(workflow) = obj.get("workflow") {
        build_list_steps(workflow)?
    } else if obj.contains_key("jobs") || obj.contains_key("triggers") {
        build_keyed_steps(obj)?
    } else {
        return Err(PlanError::Shape(
            "plan payload has neither a workflow step list nor jobs/triggers maps".to_string(),
        ));
    };

    let options = match obj.get("options") {
        Some(value) => serde_json::from_value(normalize_options(value))
            .map_err(|err| PlanError::Shape(format!("invalid plan options: {err}")))?,
        None => PlanOptions::default(),
    };

    Ok(ExecutionPlan { id, steps, options })
}

/// The list encoding: `{workflow: {steps: [{id, ...}]}}`.
fn build_list_steps(workflow: &Value) -> Result<Vec<Step>, PlanError> {
    let entries = workflow
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| PlanError::Shape("workflow.steps must be an array".to_string()))?;

    let mut steps = Vec::with_capacity(entries.len());
    for entry in entries {
        let obj = entry
            .as_object()
            .ok_or_else(|| PlanError::Shape("workflow step must be an object".to_string()))?;
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlanError::Shape("workflow step is missing an id".to_string()))?;
        steps.push(build_step(id, obj)?);
    }
    Ok(steps)
}

/// The legacy encoding: keyed maps of triggers and jobs, each entry carrying
/// its own `next` map.
fn build_keyed_steps(obj: &Map<String, Value>) -> Result<Vec<Step>, PlanError> {
    let mut steps = Vec::new();
    for key in ["triggers", "jobs"] {
        let Some(section) = obj.get(key) else {
            continue;
        };
        let entries = section.as_object().ok_or_else(|| {
            PlanError::Shape(format!("legacy `{key}` section must be a keyed map"))
        })?;
        for (id, entry) in entries {
            let body = entry
                .as_object()
                .ok_or_else(|| PlanError::Shape(format!("step `{id}` must be an object")))?;
            steps.push(build_step(id, body)?);
        }
    }
    Ok(steps)
}

fn build_step(id: &str, obj: &Map<String, Value>) -> Result<Step, PlanError> {
    let body = obj
        .get("expression")
        .or_else(|| obj.get("body"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let adaptor = match obj.get("adaptor").and_then(Value::as_str) {
        Some(spec) => Some(
            spec.parse::<AdaptorSpecifier>()
                .map_err(|err| PlanError::Shape(format!("step `{id}`: {err}")))?,
        ),
        None => None,
    };

    let configuration = obj
        .get("configuration")
        .or_else(|| obj.get("credential"))
        .filter(|value| !value.is_null())
        .map(|value| match value {
            Value::String(id) => ConfigurationRef::Id(id.clone()),
            other => ConfigurationRef::Inline(other.clone()),
        });

    let is_trigger = body.is_none();
    let next = match obj.get("next") {
        Some(next) => build_edges(id, is_trigger, next)?,
        None => BTreeMap::new(),
    };

    Ok(Step {
        id: id.to_string(),
        name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        adaptor,
        body,
        configuration,
        initial_state: obj.get("state").filter(|value| !value.is_null()).cloned(),
        next,
    })
}

fn build_edges(
    source: &str,
    source_is_trigger: bool,
    next: &Value,
) -> Result<BTreeMap<String, Edge>, PlanError> {
    let entries = next
        .as_object()
        .ok_or_else(|| PlanError::Shape(format!("step `{source}` has a non-object next map")))?;

    let mut edges = BTreeMap::new();
    for (target, spec) in entries {
        let edge = match spec {
            // `target: true` keeps the default condition; `target: false`
            // is a disabled default edge.
            Value::Bool(enabled) => Edge {
                condition: default_condition(source, source_is_trigger),
                disabled: !enabled,
            },
            Value::Object(options) => {
                let condition = match options.get("condition") {
                    None | Some(Value::Null) => default_condition(source, source_is_trigger),
                    Some(Value::String(name)) => named_condition(source, name)?,
                    Some(other) => {
                        return Err(PlanError::Shape(format!(
                            "edge {source} -> {target} has unrecognized condition {other}"
                        )));
                    }
                };
                Edge {
                    condition,
                    disabled: options
                        .get("disabled")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            }
            other => {
                return Err(PlanError::Shape(format!(
                    "edge {source} -> {target} must be a bool or an object, got {other}"
                )));
            }
        };
        edges.insert(target.clone(), edge);
    }
    Ok(edges)
}

/// A missing condition on a trigger edge means "always fires"; on a job edge
/// it means "fires on the source's success".
fn default_condition(source: &str, source_is_trigger: bool) -> EdgeCondition {
    if source_is_trigger {
        EdgeCondition::Always
    } else {
        EdgeCondition::OnSuccess(source.to_string())
    }
}

fn named_condition(source: &str, name: &str) -> Result<EdgeCondition, PlanError> {
    match name {
        "always" | "true" => Ok(EdgeCondition::Always),
        "on_job_success" => Ok(EdgeCondition::OnSuccess(source.to_string())),
        "on_job_failure" => Ok(EdgeCondition::OnFailure(source.to_string())),
        other => Err(PlanError::Shape(format!(
            "unknown edge condition `{other}` on step `{source}`"
        ))),
    }
}

/// Options arrive in wire casing (`run_timeout_ms`); older payloads used
/// camelCase for the timeout. Normalize before deserializing.
fn normalize_options(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let mut normalized = obj.clone();
    if let Some(timeout) = normalized.remove("runTimeoutMs") {
        normalized.entry("run_timeout_ms").or_insert(timeout);
    }
    Value::Object(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list_payload() -> Value {
        json!({
            "id": "plan-1",
            "workflow": {
                "steps": [
                    {"id": "trigger", "next": {"a": true}},
                    {
                        "id": "a",
                        "adaptor": "@openfn/language-common@1.7.7",
                        "expression": "[{\"op\": \"set\", \"path\": [\"a\"], \"value\": true}]",
                        "next": {
                            "x": {"condition": "on_job_success"},
                            "y": {"condition": "on_job_failure", "disabled": true}
                        }
                    },
                    {"id": "x", "expression": "[]"},
                    {"id": "y", "expression": "[]"}
                ]
            },
            "options": {"run_timeout_ms": 5000}
        })
    }

    fn keyed_payload() -> Value {
        json!({
            "id": "plan-1",
            "triggers": {
                "trigger": {"next": {"a": true}}
            },
            "jobs": {
                "a": {
                    "adaptor": "@openfn/language-common@1.7.7",
                    "expression": "[{\"op\": \"set\", \"path\": [\"a\"], \"value\": true}]",
                    "next": {
                        "x": {"condition": "on_job_success"},
                        "y": {"condition": "on_job_failure", "disabled": true}
                    }
                },
                "x": {"expression": "[]"},
                "y": {"expression": "[]"}
            },
            "options": {"runTimeoutMs": 5000}
        })
    }

    #[test]
    fn builds_list_encoding() {
        let plan = build(&list_payload()).expect("build plan");
        assert_eq!(plan.id, "plan-1");
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.options.run_timeout_ms, Some(5000));

        let trigger = plan.step("trigger").expect("trigger step");
        assert!(trigger.is_trigger());
        assert_eq!(trigger.next["a"].condition, EdgeCondition::Always);

        let a = plan.step("a").expect("job a");
        assert_eq!(
            a.next["x"].condition,
            EdgeCondition::OnSuccess("a".to_string())
        );
        assert_eq!(
            a.next["y"].condition,
            EdgeCondition::OnFailure("a".to_string())
        );
        assert!(a.next["y"].disabled);
    }

    #[test]
    fn legacy_and_list_encodings_agree() {
        let from_list = build(&list_payload()).expect("list plan");
        let from_keyed = build(&keyed_payload()).expect("keyed plan");

        // Step ordering differs between the encodings; compare as sets.
        let mut list_steps = from_list.steps.clone();
        let mut keyed_steps = from_keyed.steps.clone();
        list_steps.sort_by(|l, r| l.id.cmp(&r.id));
        keyed_steps.sort_by(|l, r| l.id.cmp(&r.id));
        assert_eq!(list_steps, keyed_steps);
        assert_eq!(from_list.options, from_keyed.options);
    }

    #[test]
    fn missing_trigger_condition_defaults_to_always() {
        let plan = build(&json!({
            "id": "p",
            "workflow": {"steps": [
                {"id": "t", "next": {"j": {}}},
                {"id": "j", "expression": "[]"}
            ]}
        }))
        .expect("build plan");
        assert_eq!(
            plan.step("t").unwrap().next["j"].condition,
            EdgeCondition::Always
        );
    }

    #[test]
    fn rejects_unknown_conditions() {
        let err = build(&json!({
            "id": "p",
            "workflow": {"steps": [
                {"id": "t", "next": {"j": {"condition": "sometimes"}}},
                {"id": "j", "expression": "[]"}
            ]}
        }))
        .expect_err("unknown condition");
        assert!(err.to_string().contains("sometimes"));
    }
}
