//! Seam to the external script-to-module compiler.
//!
//! The compiler that turns job source into executable code is a collaborator,
//! not part of this crate: the worker consumes it as a black box producing a
//! [`CompiledBody`] or a [`CompileError`]. The reference implementation here,
//! [`OpCompiler`], accepts step expressions that are already a JSON program
//! over the closed op set the sandbox runner interprets. A real deployment
//! plugs its script compiler behind the same trait.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One instruction of a compiled step body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Set `data.<path>` to a literal value.
    Set { path: Vec<String>, value: Value },
    /// Shallow-merge an object into `data`.
    Merge { value: Value },
    /// Throw a script-level error; caught by the sandbox and returned as a
    /// job failure, never a crash.
    Fail { message: String },
    /// Emit a log line attributed to the owning run.
    Log {
        #[serde(default = "default_log_level")]
        level: String,
        message: String,
    },
    /// Block for the given duration (used by long-running bodies).
    Sleep { ms: u64 },
    /// Grow resident memory by roughly the given amount.
    Allocate { mb: u64 },
    /// Terminate the sandbox process without returning a result.
    Exit { code: i32 },
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A step body after compilation, ready for the sandbox runner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledBody {
    pub ops: Vec<Op>,
}

/// Reported identically to a validation error at the run boundary: fatal
/// before any step executes.
#[derive(Debug, Error)]
#[error("compile error in step {step_id}: {message}")]
pub struct CompileError {
    pub step_id: String,
    pub message: String,
}

pub trait Compiler: Send + Sync {
    fn compile(&self, step_id: &str, source: &str) -> Result<CompiledBody, CompileError>;
}

/// Compiler for sources that are already an op-program JSON array.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpCompiler;

impl Compiler for OpCompiler {
    fn compile(&self, step_id: &str, source: &str) -> Result<CompiledBody, CompileError> {
        let ops: Vec<Op> = serde_json::from_str(source).map_err(|err| CompileError {
            step_id: step_id.to_string(),
            message: err.to_string(),
        })?;
        Ok(CompiledBody { ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiles_an_op_program() {
        let body = OpCompiler
            .compile("a", r#"[{"op": "set", "path": ["a"], "value": true}]"#)
            .expect("compile");
        assert_eq!(
            body.ops,
            vec![Op::Set {
                path: vec!["a".to_string()],
                value: json!(true)
            }]
        );
    }

    #[test]
    fn surfaces_compile_errors_with_the_step_id() {
        let err = OpCompiler.compile("broken", "fn main() {}").unwrap_err();
        assert_eq!(err.step_id, "broken");
    }
}
