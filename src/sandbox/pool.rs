//! Process-backed sandbox pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::process::run_child;
use super::{ExecLimits, LogSink, Outcome, SandboxError, SandboxPool, StepTask};

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum script bodies executing concurrently; excess requests queue.
    pub capacity: usize,
    /// Path to the `filament-sandbox` binary.
    pub sandbox_bin: PathBuf,
}

impl PoolConfig {
    pub fn new(sandbox_bin: PathBuf) -> Self {
        Self {
            capacity: num_cpus::get().max(1),
            sandbox_bin,
        }
    }
}

/// Fixed-capacity pool spawning one fresh child process per execution.
///
/// Capacity is a semaphore; a crashed child releases its permit through the
/// normal drop path, so a crash under capacity=1 never blocks the next
/// queued task.
pub struct ProcessPool {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    stopped: AtomicBool,
    logs: LogSink,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, logs: LogSink) -> Self {
        let capacity = config.capacity.max(1);
        info!(
            capacity,
            sandbox_bin = %config.sandbox_bin.display(),
            "starting sandbox pool"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            stopped: AtomicBool::new(false),
            config,
            logs,
        }
    }
}

#[async_trait]
impl SandboxPool for ProcessPool {
    async fn execute(&self, task: StepTask, limits: ExecLimits) -> Result<Outcome, SandboxError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SandboxError::Stopped);
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SandboxError::Stopped)?;

        let outcome = run_child(&self.config.sandbox_bin, task, limits, &self.logs).await?;
        match &outcome {
            Outcome::Crash(message) => {
                metrics::counter!("filament_sandbox_crashes_total").increment(1);
                warn!(%message, "sandbox context crashed");
            }
            Outcome::Kill(reason) => {
                metrics::counter!("filament_sandbox_kills_total").increment(1);
                warn!(message = %reason.message(), "sandbox context killed");
            }
            _ => {}
        }
        Ok(outcome)
    }

    fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
