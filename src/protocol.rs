//! Wire protocol: envelopes, topics, and event payloads.
//!
//! Everything crossing the orchestrator channel is a JSON [`Envelope`] of
//! `{topic, event, ref?, payload}`. Replies echo the requester's `ref`.
//! Payload field names here are the wire contract and must not be renamed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Topic the worker joins to claim work.
pub const WORKER_TOPIC: &str = "worker:queue";

/// Topic scoped to a single run.
pub fn run_topic(run_id: &str) -> String {
    format!("run:{run_id}")
}

/// Wire event names.
pub mod event {
    pub const JOIN: &str = "join";
    pub const REPLY: &str = "reply";
    pub const CLAIM: &str = "claim";
    pub const FETCH_ATTEMPT: &str = "fetch:attempt";
    pub const FETCH_CREDENTIAL: &str = "fetch:credential";
    pub const FETCH_DATACLIP: &str = "fetch:dataclip";
    pub const RUN_START: &str = "run:start";
    pub const RUN_COMPLETE: &str = "run:complete";
    pub const STEP_START: &str = "step:start";
    pub const STEP_COMPLETE: &str = "step:complete";
    pub const LOG: &str = "log";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<u64>,
    #[serde(default)]
    pub payload: Value,
}

/// Outcome classification attached to step and run completion events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Success,
    Fail,
    Crash,
    Kill,
    Exception,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Reason::Success => "success",
            Reason::Fail => "fail",
            Reason::Crash => "crash",
            Reason::Kill => "kill",
            Reason::Exception => "exception",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub demand: usize,
}

/// One claimed unit of work. The plan body itself is fetched lazily over
/// the run topic (`fetch:attempt`), never pushed inline with the claim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClaimedRun {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClaimReply {
    #[serde(default)]
    pub runs: Vec<ClaimedRun>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepStartPayload {
    pub job_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_dataclip_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepCompletePayload {
    pub job_id: String,
    pub step_id: String,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Milliseconds spent executing the step.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dataclip: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dataclip_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunCompletePayload {
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_dataclip_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub level: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Reply payload convention: `{status, response}` with `status` of `ok` or
/// `error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".to_string(),
            response,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            response: Value::String(message.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("join rejected for {topic}: {message}")]
    JoinRejected { topic: String, message: String },
    #[error("request {event} failed: {message}")]
    RequestFailed { event: String, message: String },
    #[error("request {0} timed out")]
    RequestTimeout(String),
    #[error("malformed wire payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_the_wire_ref_name() {
        let envelope = Envelope {
            topic: run_topic("r1"),
            event: event::STEP_START.to_string(),
            reference: Some(4),
            payload: json!({"job_id": "a", "step_id": "s", "input_dataclip_id": null}),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["ref"], json!(4));
        assert_eq!(wire["topic"], json!("run:r1"));
    }

    #[test]
    fn reasons_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Reason::Kill).unwrap(), json!("kill"));
        assert_eq!(Reason::Exception.to_string(), "exception");
    }
}
