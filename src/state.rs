//! Run state threaded along plan edges.
//!
//! A [`RunState`] is the value every step body receives and returns. Each
//! branch fork deep-clones the state so sibling branches never observe each
//! other's mutations; that clone is the isolation guarantee, not an
//! optimization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured failure attached to `RunState.errors` under the step id that
/// produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn job_error(message: impl Into<String>) -> Self {
        Self::new("JobError", message)
    }
}

/// The state value produced by one step and consumed by its successors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, ErrorInfo>,
}

impl RunState {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            references: Vec::new(),
            errors: BTreeMap::new(),
        }
    }

    /// Parse a dataclip body into a run state. A bare object that does not
    /// look like a state envelope is wrapped as `{data: <body>}`.
    pub fn from_dataclip(body: Value) -> Self {
        match body {
            Value::Object(ref map) if map.contains_key("data") => {
                serde_json::from_value(body.clone()).unwrap_or_else(|_| RunState::new(body))
            }
            other => RunState::new(other),
        }
    }

    pub fn data_object(&self) -> Map<String, Value> {
        match &self.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// Whether the given step has a recorded failure.
    pub fn step_failed(&self, step_id: &str) -> bool {
        self.errors.contains_key(step_id)
    }

    pub fn record_error(&mut self, step_id: impl Into<String>, error: ErrorInfo) {
        self.errors.insert(step_id.into(), error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wraps_bare_dataclip_bodies() {
        let state = RunState::from_dataclip(json!({"count": 22}));
        assert_eq!(state.data, json!({"count": 22}));
        assert!(state.errors.is_empty());
    }

    #[test]
    fn parses_state_envelopes() {
        let state = RunState::from_dataclip(json!({
            "data": {"a": 1},
            "errors": {"x": {"type": "JobError", "message": "abort"}}
        }));
        assert_eq!(state.data, json!({"a": 1}));
        assert!(state.step_failed("x"));
        assert!(!state.step_failed("y"));
    }

    #[test]
    fn clone_isolates_errors() {
        let mut parent = RunState::new(json!({}));
        let child = parent.clone();
        parent.record_error("a", ErrorInfo::job_error("late failure"));
        assert!(child.errors.is_empty());
    }
}
