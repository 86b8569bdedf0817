//! One child-process sandbox execution.
//!
//! The parent writes a single task envelope to the child's stdin, then
//! selects over three futures until resolution: the child's stdout (log
//! lines, then one result line), the wall-clock deadline, and a
//! resident-memory sampler. A child that exits without writing a result is
//! a crash; the exit status is folded into the synthesized message.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, warn};

use super::{ExecLimits, KillReason, LogSink, Outcome, SandboxError, SandboxLog, StepTask};
use crate::state::{ErrorInfo, RunState};

const OOM_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Line written by the sandbox child on stdout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildMessage {
    Log { level: String, message: String },
    Result { result: ChildResult },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildResult {
    Success { state: RunState },
    Fail { error: ErrorInfo },
}

pub(super) async fn run_child(
    sandbox_bin: &Path,
    task: StepTask,
    limits: ExecLimits,
    logs: &LogSink,
) -> Result<Outcome, SandboxError> {
    let mut child = Command::new(sandbox_bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| SandboxError::Spawn(format!("{}: {err}", sandbox_bin.display())))?;

    debug!(
        pid = child.id(),
        run_id = %task.run_id,
        step_id = %task.step_id,
        "spawned sandbox context"
    );

    let run_id = task.run_id.clone();
    let step_id = task.step_id.clone();

    let mut stdin = child.stdin.take().ok_or_else(|| {
        SandboxError::Protocol("sandbox child has no stdin handle".to_string())
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        SandboxError::Protocol("sandbox child has no stdout handle".to_string())
    })?;

    let mut envelope = serde_json::to_vec(&task)
        .map_err(|err| SandboxError::Protocol(err.to_string()))?;
    envelope.push(b'\n');
    stdin.write_all(&envelope).await?;
    stdin.flush().await?;
    drop(stdin);

    let mut lines = BufReader::new(stdout).lines();
    let limit_ms = limits.timeout.as_millis() as u64;
    let deadline = sleep(limits.timeout);
    tokio::pin!(deadline);
    let mut oom_tick = interval(OOM_SAMPLE_INTERVAL);
    oom_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<ChildMessage>(&line) {
                    Ok(ChildMessage::Log { level, message }) => {
                        let entry = SandboxLog {
                            run_id: run_id.clone(),
                            step_id: step_id.clone(),
                            level,
                            message,
                        };
                        if logs.send(entry).await.is_err() {
                            debug!("sandbox log sink closed; dropping line");
                        }
                    }
                    Ok(ChildMessage::Result { result }) => {
                        let _ = child.wait().await;
                        return Ok(match result {
                            ChildResult::Success { state } => Outcome::Success(state),
                            ChildResult::Fail { error } => Outcome::Fail(error),
                        });
                    }
                    Err(err) => {
                        warn!(%err, run_id = %run_id, "unparseable sandbox output line");
                    }
                },
                Ok(None) => {
                    // stdout closed without a result line.
                    let status = child.wait().await?;
                    return Ok(Outcome::Crash(crash_message(status)));
                }
                Err(err) => {
                    kill_and_reap(&mut child).await;
                    return Ok(Outcome::Crash(format!("sandbox stdout failed: {err}")));
                }
            },
            _ = &mut deadline => {
                kill_and_reap(&mut child).await;
                return Ok(Outcome::Kill(KillReason::Timeout { limit_ms }));
            }
            _ = oom_tick.tick() => {
                if let Some(limit_mb) = limits.memory_limit_mb
                    && let Some(rss_mb) = resident_mb(child.id())
                    && rss_mb > limit_mb
                {
                    kill_and_reap(&mut child).await;
                    return Ok(Outcome::Kill(KillReason::Oom { limit_mb }));
                }
            }
        }
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to kill sandbox child");
    }
    let _ = child.wait().await;
}

fn crash_message(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("sandbox exited with code {code} before returning a result"),
        None => "sandbox terminated by signal before returning a result".to_string(),
    }
}

/// Resident set size of a live child, in MiB. Linux only; elsewhere the
/// ceiling is unenforced.
#[cfg(target_os = "linux")]
fn resident_mb(pid: Option<u32>) -> Option<u64> {
    let pid = pid?;
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096 / (1024 * 1024))
}

#[cfg(not(target_os = "linux"))]
fn resident_mb(_pid: Option<u32>) -> Option<u64> {
    None
}
