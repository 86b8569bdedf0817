//! Interpreter for compiled op programs.
//!
//! Shared by the `filament-sandbox` child binary and the in-process
//! [`InlinePool`](super::InlinePool). A `fail` op is caught here and
//! returned as a job failure; an `exit` op escapes the interpreter
//! entirely (in a child process it takes the process down, which the
//! parent classifies as a crash).

use serde_json::{Map, Value};

use crate::compiler::{CompiledBody, Op};
use crate::state::{ErrorInfo, RunState};

/// How a body evaluation ended, before process-level classification.
#[derive(Debug)]
pub enum BodyEval {
    Complete(RunState),
    Failed(ErrorInfo),
    /// The body requested process termination with this code.
    Exit(i32),
}

/// Run a compiled body against its input state, emitting log lines through
/// `log`.
pub async fn interpret(
    body: &CompiledBody,
    mut state: RunState,
    mut log: impl FnMut(&str, &str),
) -> BodyEval {
    // Allocations stay resident until the body finishes.
    let mut ballast: Vec<Vec<u8>> = Vec::new();

    for op in &body.ops {
        match op {
            Op::Set { path, value } => set_path(&mut state.data, path, value.clone()),
            Op::Merge { value } => {
                if let (Value::Object(data), Value::Object(incoming)) = (&mut state.data, value) {
                    for (key, entry) in incoming {
                        data.insert(key.clone(), entry.clone());
                    }
                }
            }
            Op::Fail { message } => return BodyEval::Failed(ErrorInfo::job_error(message)),
            Op::Log { level, message } => log(level, message),
            Op::Sleep { ms } => tokio::time::sleep(std::time::Duration::from_millis(*ms)).await,
            Op::Allocate { mb } => {
                let bytes = (*mb as usize).saturating_mul(1024 * 1024);
                // Touch every page so the allocation shows up as resident.
                let mut chunk = vec![0u8; bytes];
                for idx in (0..chunk.len()).step_by(4096) {
                    chunk[idx] = 1;
                }
                ballast.push(chunk);
            }
            Op::Exit { code } => return BodyEval::Exit(*code),
        }
    }

    BodyEval::Complete(state)
}

fn set_path(data: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *data = value;
        return;
    }
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    let mut cursor = data;
    for key in &path[..path.len() - 1] {
        let map = cursor.as_object_mut().expect("cursor is an object");
        let slot = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cursor = slot;
    }
    let map = cursor.as_object_mut().expect("cursor is an object");
    map.insert(path[path.len() - 1].clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(ops: &str, input: Value) -> BodyEval {
        let body: CompiledBody = CompiledBody {
            ops: serde_json::from_str(ops).expect("parse ops"),
        };
        interpret(&body, RunState::new(input), |_, _| {}).await
    }

    #[tokio::test]
    async fn set_creates_nested_paths() {
        let eval = run(
            r#"[{"op": "set", "path": ["outer", "inner"], "value": 7}]"#,
            json!({"count": 22}),
        )
        .await;
        let BodyEval::Complete(state) = eval else {
            panic!("expected completion");
        };
        assert_eq!(state.data, json!({"count": 22, "outer": {"inner": 7}}));
    }

    #[tokio::test]
    async fn fail_is_caught_as_a_job_error() {
        let eval = run(r#"[{"op": "fail", "message": "abort"}]"#, json!({})).await;
        let BodyEval::Failed(error) = eval else {
            panic!("expected failure");
        };
        assert_eq!(error.error_type, "JobError");
        assert_eq!(error.message, "abort");
    }

    #[tokio::test]
    async fn logs_are_forwarded_in_order() {
        let body = CompiledBody {
            ops: serde_json::from_str(
                r#"[
                    {"op": "log", "message": "first"},
                    {"op": "log", "level": "debug", "message": "second"}
                ]"#,
            )
            .unwrap(),
        };
        let mut lines = Vec::new();
        let _ = interpret(&body, RunState::default(), |level, message| {
            lines.push(format!("{level}: {message}"));
        })
        .await;
        assert_eq!(lines, vec!["info: first", "debug: second"]);
    }
}
