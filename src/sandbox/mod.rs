//! Sandbox pool: isolated, resource-limited execution of compiled step
//! bodies.
//!
//! Every execution gets a fresh OS process so adaptor-level module state is
//! never shared between two executions, concurrent or sequential. The pool
//! enforces a fixed capacity, wall-clock timeouts, a resident-memory
//! ceiling, and survives child crashes by restoring the capacity slot
//! immediately.

mod inline;
mod pool;
mod process;
pub mod runner;

pub use inline::InlinePool;
pub use pool::{PoolConfig, ProcessPool};
pub use process::{ChildMessage, ChildResult};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::compiler::CompiledBody;
use crate::state::{ErrorInfo, RunState};

/// One step body queued for sandboxed execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepTask {
    pub run_id: String,
    pub step_id: String,
    pub body: CompiledBody,
    pub input: RunState,
    /// Resolved credential material, kept out of [`RunState`] so it can
    /// never leak into step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
}

/// Resource limits for a single execution. The run-level timeout override
/// takes precedence over the pool default before the task reaches the pool.
#[derive(Clone, Copy, Debug)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub memory_limit_mb: Option<u64>,
}

/// Why a context was forcibly terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillReason {
    Timeout { limit_ms: u64 },
    Oom { limit_mb: u64 },
}

impl KillReason {
    pub fn error_type(&self) -> &'static str {
        match self {
            KillReason::Timeout { .. } => "TimeoutError",
            KillReason::Oom { .. } => "OomError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            KillReason::Timeout { limit_ms } => {
                format!("Workflow failed to return within {limit_ms}ms")
            }
            KillReason::Oom { limit_mb } => {
                format!("Workflow exceeded the {limit_mb}MB memory ceiling")
            }
        }
    }
}

/// Result of one sandboxed execution.
///
/// `Fail` is a script-level thrown error caught inside the sandbox and
/// returned; it is not a pool failure. `Crash` means the context died
/// without returning structured data.
#[derive(Clone, Debug)]
pub enum Outcome {
    Success(RunState),
    Fail(ErrorInfo),
    Kill(KillReason),
    Crash(String),
}

/// A log line produced inside a sandbox, tagged with its owning run.
#[derive(Clone, Debug)]
pub struct SandboxLog {
    pub run_id: String,
    pub step_id: String,
    pub level: String,
    pub message: String,
}

pub type LogSink = mpsc::Sender<SandboxLog>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox pool is stopped")]
    Stopped,
    #[error("failed to spawn sandbox: {0}")]
    Spawn(String),
    #[error("sandbox wire error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Capacity-bounded executor of step tasks.
#[async_trait]
pub trait SandboxPool: Send + Sync {
    /// Execute one task, queueing while the pool is at capacity.
    async fn execute(&self, task: StepTask, limits: ExecLimits) -> Result<Outcome, SandboxError>;

    fn capacity(&self) -> usize;

    /// Capacity slots not currently running a context.
    fn available(&self) -> usize;

    /// Stop accepting new work; in-flight contexts run to completion.
    fn stop(&self);
}
