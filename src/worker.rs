//! Worker daemon: wires the channel, claim loop, sandbox pool, and adaptor
//! repo into a running service.
//!
//! One worker process holds one orchestrator channel. Claimed runs execute
//! concurrently on the shared pool, each with its own run topic and
//! publisher. Shutdown stops claiming immediately and lets in-flight runs
//! finish before the pool closes.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::compiler::{Compiler, OpCompiler};
use crate::config::Config;
use crate::executor::{Executor, RunReport};
use crate::install::{CliRegistry, Repo};
use crate::plan;
use crate::protocol::{ClaimedRun, Reason, WORKER_TOPIC, event, run_topic};
use crate::publisher::Publisher;
use crate::queue::{ClaimConfig, ClaimLoop};
use crate::resolver::{ChannelResolver, Resolver};
use crate::sandbox::{PoolConfig, ProcessPool, SandboxLog, SandboxPool};
use crate::scrub::Scrubber;
use crate::state::{ErrorInfo, RunState};
use crate::transport::WebsocketTransport;

struct Core {
    config: Config,
    channel: Channel,
    pool: Arc<dyn SandboxPool>,
    repo: Option<Arc<Repo>>,
    compiler: Arc<dyn Compiler>,
    /// One scrubber for the whole worker. Secrets accumulate across runs,
    /// so a late log line from a finished run is still redacted.
    scrubber: Arc<Scrubber>,
}

pub struct Worker {
    core: Arc<Core>,
    logs: mpsc::Receiver<SandboxLog>,
}

impl Worker {
    /// Connect to the orchestrator and assemble the production stack:
    /// websocket channel, process pool, and npm-backed adaptor repo.
    pub async fn connect(config: Config) -> Result<Self> {
        let transport = WebsocketTransport::connect(&config.orchestrator_url)
            .await
            .with_context(|| format!("connecting to {}", config.orchestrator_url))?;
        let channel = Channel::spawn(transport);

        let (log_tx, log_rx) = mpsc::channel(1024);
        let mut pool_config = PoolConfig::new(config.sandbox_bin.clone());
        pool_config.capacity = config.capacity;
        let pool = Arc::new(ProcessPool::new(pool_config, log_tx));

        let registry = Arc::new(CliRegistry::new(config.npm_bin.clone()));
        let repo = Repo::open(&config.repo_dir, registry, config.keep_unsupported)
            .await
            .context("opening adaptor repo")?;

        Ok(Self::assemble(
            config,
            channel,
            pool,
            Some(Arc::new(repo)),
            Arc::new(OpCompiler),
            log_rx,
        ))
    }

    /// Assemble a worker from parts. Tests inject memory transports and
    /// inline pools here.
    pub fn assemble(
        config: Config,
        channel: Channel,
        pool: Arc<dyn SandboxPool>,
        repo: Option<Arc<Repo>>,
        compiler: Arc<dyn Compiler>,
        logs: mpsc::Receiver<SandboxLog>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                config,
                channel,
                pool,
                repo,
                compiler,
                scrubber: Arc::new(Scrubber::default()),
            }),
            logs,
        }
    }

    /// Serve until the shutdown signal flips. Joining the worker queue is
    /// the only fatal failure; everything after degrades per run.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let core = Arc::clone(&self.core);

        core.channel
            .join(
                WORKER_TOPIC,
                json!({ "token": core.config.worker_token }),
            )
            .await
            .context("joining the worker queue")?;
        info!(capacity = core.config.capacity, "joined worker queue");

        let log_forwarder = tokio::spawn(forward_sandbox_logs(
            Arc::clone(&core),
            self.logs,
        ));

        let (claimed_tx, mut claimed_rx) = mpsc::channel(core.config.max_claim.max(1));
        let claim_loop = ClaimLoop::start(
            ClaimConfig {
                max_claim: core.config.max_claim,
                backoff_min: core.config.claim_backoff_min,
                backoff_max: core.config.claim_backoff_max,
            },
            core.channel.clone(),
            Arc::clone(&core.pool),
            claimed_tx,
        );

        let mut runs: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                claimed = claimed_rx.recv() => match claimed {
                    Some(run) => {
                        metrics::counter!("filament_runs_claimed_total").increment(1);
                        let core = Arc::clone(&core);
                        runs.spawn(async move {
                            handle_run(core, run).await;
                        });
                    }
                    None => {
                        // Claim loop gone; nothing more will arrive.
                        break;
                    }
                },
                Some(result) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(err) = result {
                        error!(?err, "run task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(err) = claim_loop.shutdown().await {
            warn!(%err, "claim loop did not stop cleanly");
        }
        // Runs claimed before the stop signal may still sit in the buffer;
        // they belong to this worker now and must execute.
        while let Some(run) = claimed_rx.recv().await {
            metrics::counter!("filament_runs_claimed_total").increment(1);
            let core = Arc::clone(&core);
            runs.spawn(async move {
                handle_run(core, run).await;
            });
        }
        while let Some(result) = runs.join_next().await {
            if let Err(err) = result {
                error!(?err, "run task panicked during drain");
            }
        }
        core.pool.stop();
        log_forwarder.abort();
        info!("worker stopped");
        Ok(())
    }
}

/// Execute one claimed run end to end. Failures never propagate: every
/// path either publishes a terminal event or logs why it could not.
async fn handle_run(core: Arc<Core>, run: ClaimedRun) {
    let topic = run_topic(&run.id);
    let join_payload = match &run.token {
        Some(token) => json!({ "token": token }),
        None => json!({}),
    };
    if let Err(err) = core.channel.join(&topic, join_payload).await {
        warn!(run_id = %run.id, %err, "could not join run topic; abandoning run");
        return;
    }

    let attempt = match core
        .channel
        .request(&topic, event::FETCH_ATTEMPT, json!({}))
        .await
    {
        Ok(attempt) => attempt,
        Err(err) => {
            warn!(run_id = %run.id, %err, "could not fetch run attempt");
            return;
        }
    };

    let publisher = Arc::new(Publisher::new(
        core.channel.clone(),
        run.id.clone(),
        Arc::clone(&core.scrubber),
    ));
    let report = execute_attempt(&core, &run.id, attempt, &publisher).await;

    metrics::counter!("filament_runs_total", "reason" => report.reason.to_string()).increment(1);
    if let Err(err) = publisher.run_complete(&report).await {
        warn!(run_id = %run.id, %err, "could not publish run completion");
    }
}

async fn execute_attempt(
    core: &Arc<Core>,
    run_id: &str,
    attempt: Value,
    publisher: &Arc<Publisher>,
) -> RunReport {
    let plan = match plan::build(&attempt) {
        Ok(plan) => plan,
        Err(err) => {
            warn!(run_id, %err, "claimed run has a malformed plan");
            return RunReport {
                reason: Reason::Exception,
                error: Some(ErrorInfo::new("PlanShapeError", err.to_string())),
                final_state: None,
                final_dataclip_id: None,
            };
        }
    };

    let resolver: Arc<dyn Resolver> =
        Arc::new(ChannelResolver::new(core.channel.clone(), run_id));
    let input_dataclip_id = attempt
        .get("dataclip_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let initial = match &input_dataclip_id {
        Some(id) => match resolver.fetch_dataclip(id).await {
            Ok(body) => RunState::from_dataclip(body),
            Err(err) => {
                warn!(run_id, %err, "could not fetch the input dataclip");
                return RunReport {
                    reason: Reason::Exception,
                    error: Some(ErrorInfo::new(err.error_type(), err.to_string())),
                    final_state: None,
                    final_dataclip_id: None,
                };
            }
        },
        None => RunState::default(),
    };

    if let Err(err) = publisher.run_start().await {
        warn!(run_id, %err, "run start was not acknowledged");
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let pump = {
        let publisher = Arc::clone(publisher);
        tokio::spawn(async move { publisher.pump(events_rx).await })
    };

    let mut executor = Executor::new(
        run_id,
        Arc::clone(&core.pool),
        Arc::clone(&core.compiler),
        resolver,
        events_tx,
    )
    .with_scrubber(Arc::clone(&core.scrubber))
    .with_default_timeout(core.config.run_timeout)
    .with_default_memory_limit_mb(core.config.run_memory_limit_mb);
    if let Some(repo) = &core.repo {
        executor = executor.with_repo(Arc::clone(repo));
    }

    let report = executor.run(&plan, initial, input_dataclip_id).await;
    // Dropping the executor closes the event stream; the pump drains what
    // is left before run completion goes out.
    drop(executor);
    let _ = pump.await;
    report
}

/// Route sandbox log lines onto their runs' topics, scrubbed.
async fn forward_sandbox_logs(core: Arc<Core>, mut logs: mpsc::Receiver<SandboxLog>) {
    while let Some(log) = logs.recv().await {
        let payload = crate::protocol::LogPayload {
            run_id: log.run_id.clone(),
            step_id: Some(log.step_id),
            level: log.level,
            message: core.scrubber.scrub(&log.message),
            timestamp: chrono::Utc::now(),
        };
        let topic = run_topic(&log.run_id);
        match serde_json::to_value(payload) {
            Ok(payload) => {
                if let Err(err) = core.channel.push(&topic, event::LOG, payload).await {
                    warn!(run_id = %log.run_id, %err, "could not forward sandbox log");
                }
            }
            Err(err) => warn!(%err, "unserializable log payload"),
        }
    }
}
