//! Typed plan model: steps, edges, and run options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::install::AdaptorSpecifier;

/// Condition controlling whether an edge fires after its source completes.
///
/// The closed variant set replaces the string predicates of the wire format;
/// evaluation happens directly against the run state's error map, so the
/// executor never needs an expression evaluator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "step", rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    OnSuccess(String),
    OnFailure(String),
}

/// Directed link from one step to another, stored on the source step's
/// `next` map keyed by target id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub condition: EdgeCondition,
    #[serde(default)]
    pub disabled: bool,
}

impl Edge {
    pub fn always() -> Self {
        Self {
            condition: EdgeCondition::Always,
            disabled: false,
        }
    }

    pub fn on_success(source: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::OnSuccess(source.into()),
            disabled: false,
        }
    }

    pub fn on_failure(source: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::OnFailure(source.into()),
            disabled: false,
        }
    }
}

/// Reference to the credential a step runs with: either an opaque id the
/// resolver fetches lazily, or an inline configuration object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigurationRef {
    Id(String),
    Inline(Value),
}

/// One node of the plan. A step without a body is a trigger (fan-out only);
/// a step with a body is a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor: Option<AdaptorSpecifier>,
    /// Uncompiled step body source, exactly as claimed off the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationRef>,
    /// Partial initial state merged over the incoming state's `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next: BTreeMap<String, Edge>,
}

impl Step {
    pub fn is_trigger(&self) -> bool {
        self.body.is_none()
    }
}

/// Per-run options carried alongside the steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Run exactly this one step and visit no edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_memory_limit_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_memory_limit_mb: Option<u64>,
    /// When false, step outputs are not posted back as dataclips.
    #[serde(default = "default_output_dataclips")]
    pub output_dataclips: bool,
}

fn default_output_dataclips() -> bool {
    true
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            only: None,
            run_timeout_ms: None,
            run_memory_limit_mb: None,
            payload_memory_limit_mb: None,
            output_dataclips: true,
        }
    }
}

/// The validated DAG of steps and edges for one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub options: PlanOptions,
}

impl ExecutionPlan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }
}
