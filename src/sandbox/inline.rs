//! In-process sandbox pool for tests.
//!
//! Runs the same op interpreter as the child binary, but inside the test's
//! own runtime: an `exit` op becomes a simulated crash instead of taking
//! the process down, and the memory ceiling is not enforced. Behavior
//! around capacity, timeouts, caught failures, and graceful stop matches
//! [`ProcessPool`](super::ProcessPool).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::timeout;

use super::runner::{BodyEval, interpret};
use super::{
    ExecLimits, KillReason, LogSink, Outcome, SandboxError, SandboxLog, SandboxPool, StepTask,
};

pub struct InlinePool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    stopped: AtomicBool,
    logs: LogSink,
}

impl InlinePool {
    pub fn new(capacity: usize, logs: LogSink) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            stopped: AtomicBool::new(false),
            logs,
        }
    }

    /// Pool with a discarded log stream, for tests that only assert
    /// outcomes.
    pub fn detached(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self::new(capacity, tx)
    }
}

#[async_trait]
impl SandboxPool for InlinePool {
    async fn execute(&self, task: StepTask, limits: ExecLimits) -> Result<Outcome, SandboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SandboxError::Stopped);
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SandboxError::Stopped)?;

        let logs = self.logs.clone();
        let run_id = task.run_id.clone();
        let step_id = task.step_id.clone();
        let limit_ms = limits.timeout.as_millis() as u64;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(String, String)>();
        let forwarder = tokio::spawn(async move {
            while let Some((level, message)) = line_rx.recv().await {
                let _ = logs
                    .send(SandboxLog {
                        run_id: run_id.clone(),
                        step_id: step_id.clone(),
                        level,
                        message,
                    })
                    .await;
            }
        });

        let body = task.body;
        let input = task.input;
        let eval = timeout(limits.timeout, async move {
            interpret(&body, input, |level, message| {
                let _ = line_tx.send((level.to_string(), message.to_string()));
            })
            .await
        })
        .await;
        let _ = forwarder.await;

        Ok(match eval {
            Ok(BodyEval::Complete(state)) => Outcome::Success(state),
            Ok(BodyEval::Failed(error)) => Outcome::Fail(error),
            Ok(BodyEval::Exit(code)) => Outcome::Crash(format!(
                "sandbox exited with code {code} before returning a result"
            )),
            Err(_) => Outcome::Kill(KillReason::Timeout { limit_ms }),
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompiledBody, Op};
    use crate::state::RunState;
    use serde_json::json;
    use std::time::Duration;

    fn task(ops: Vec<Op>) -> StepTask {
        StepTask {
            run_id: "r".to_string(),
            step_id: "s".to_string(),
            body: CompiledBody { ops },
            input: RunState::new(json!({})),
            configuration: None,
        }
    }

    fn limits(ms: u64) -> ExecLimits {
        ExecLimits {
            timeout: Duration::from_millis(ms),
            memory_limit_mb: None,
        }
    }

    #[tokio::test]
    async fn hung_bodies_are_killed_with_the_limit_in_the_message() {
        let pool = InlinePool::detached(1);
        let outcome = pool
            .execute(task(vec![Op::Sleep { ms: 60_000 }]), limits(100))
            .await
            .expect("execute");
        let Outcome::Kill(reason) = outcome else {
            panic!("expected kill, got {outcome:?}");
        };
        assert_eq!(reason.message(), "Workflow failed to return within 100ms");
        assert_eq!(reason.error_type(), "TimeoutError");
    }

    #[tokio::test]
    async fn crash_under_capacity_one_frees_the_slot() {
        let pool = InlinePool::detached(1);
        let crashed = pool
            .execute(task(vec![Op::Exit { code: 2 }]), limits(1_000))
            .await
            .expect("execute");
        assert!(matches!(crashed, Outcome::Crash(_)));
        assert_eq!(pool.available(), 1);

        let next = pool
            .execute(
                task(vec![Op::Set {
                    path: vec!["ok".to_string()],
                    value: json!(true),
                }]),
                limits(1_000),
            )
            .await
            .expect("execute");
        let Outcome::Success(state) = next else {
            panic!("expected success after crash, got {next:?}");
        };
        assert_eq!(state.data, json!({"ok": true}));
    }

    #[tokio::test]
    async fn stopped_pool_rejects_new_work() {
        let pool = InlinePool::detached(1);
        pool.stop();
        let err = pool
            .execute(task(vec![]), limits(1_000))
            .await
            .expect_err("stopped");
        assert!(matches!(err, SandboxError::Stopped));
    }
}
