//! Claim loop: asks the orchestrator for work sized to current capacity.
//!
//! The loop claims eagerly while work is flowing and backs off
//! exponentially (with jitter) while the queue is dry. A shutdown signal
//! permanently stops claiming; runs already handed off keep executing.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use rand::Rng;
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::protocol::{ChannelError, ClaimReply, ClaimedRun, WORKER_TOPIC, event};
use crate::sandbox::SandboxPool;

#[derive(Clone, Debug)]
pub struct ClaimConfig {
    /// Upper bound on runs requested per claim.
    pub max_claim: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_claim: num_cpus::get().max(1),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_millis(10_000),
        }
    }
}

pub struct ClaimLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl ClaimLoop {
    /// Start claiming; each claimed run is handed to `claimed_tx`.
    pub fn start(
        config: ClaimConfig,
        channel: Channel,
        pool: Arc<dyn SandboxPool>,
        claimed_tx: mpsc::Sender<ClaimedRun>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = ClaimTask {
                config,
                channel,
                pool,
                claimed_tx,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "claim loop terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("claim loop task panicked: {err}")),
        }
    }
}

struct ClaimTask {
    config: ClaimConfig,
    channel: Channel,
    pool: Arc<dyn SandboxPool>,
    claimed_tx: mpsc::Sender<ClaimedRun>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ClaimTask {
    async fn run(mut self) -> Result<()> {
        info!(
            max_claim = self.config.max_claim,
            backoff_min_ms = self.config.backoff_min.as_millis(),
            backoff_max_ms = self.config.backoff_max.as_millis(),
            "starting claim loop",
        );

        let mut backoff = self.config.backoff_min;
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            // Never ask for more runs than idle sandbox slots.
            let demand = self.pool.available().min(self.config.max_claim);
            let claimed = if demand == 0 {
                0
            } else {
                match self.claim(demand).await {
                    Ok(count) => count,
                    Err(ChannelError::Closed) => {
                        return Err(anyhow!("orchestrator channel closed"));
                    }
                    Err(err) => {
                        metrics::counter!("filament_claim_errors_total").increment(1);
                        warn!(%err, "claim request failed");
                        0
                    }
                }
            };

            if claimed > 0 {
                backoff = self.config.backoff_min;
                continue;
            }

            let delay = jittered(self.config.backoff_min, backoff);
            backoff = (backoff * 2).min(self.config.backoff_max);
            tokio::select! {
                _ = sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("claim loop shutting down");
        Ok(())
    }

    async fn claim(&self, demand: usize) -> Result<usize, ChannelError> {
        let response = self
            .channel
            .request(WORKER_TOPIC, event::CLAIM, json!({ "demand": demand }))
            .await?;
        let reply: ClaimReply = serde_json::from_value(response)?;
        let count = reply.runs.len();
        metrics::counter!("filament_claimed_runs_total").increment(count as u64);
        debug!(demand, claimed = count, "claim cycle");
        for run in reply.runs {
            if self.claimed_tx.send(run).await.is_err() {
                // Receiver gone means the worker is tearing down.
                return Err(ChannelError::Closed);
            }
        }
        Ok(count)
    }
}

fn jittered(floor: Duration, ceiling: Duration) -> Duration {
    if ceiling <= floor {
        return floor;
    }
    let span = (ceiling - floor).as_millis() as u64;
    let offset = rand::thread_rng().gen_range(0..=span);
    floor + Duration::from_millis(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Reply};
    use crate::sandbox::InlinePool;
    use crate::transport::{MemoryTransport, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn claim_reply(runs: Vec<ClaimedRun>) -> Reply {
        Reply::ok(serde_json::to_value(ClaimReply { runs }).unwrap())
    }

    #[tokio::test]
    async fn claims_until_the_queue_is_dry() {
        let (local, mut remote) = MemoryTransport::pair();
        let channel = Channel::spawn(local);
        let (claimed_tx, mut claimed_rx) = mpsc::channel(8);

        let claims_seen = Arc::new(AtomicUsize::new(0));
        let peer_claims = Arc::clone(&claims_seen);
        let peer = tokio::spawn(async move {
            loop {
                let Ok(Some(inbound)) = remote.recv().await else {
                    break;
                };
                assert_eq!(inbound.event, event::CLAIM);
                let n = peer_claims.fetch_add(1, Ordering::SeqCst);
                let runs = if n == 0 {
                    vec![ClaimedRun {
                        id: "run-1".to_string(),
                        token: Some("tok".to_string()),
                    }]
                } else {
                    vec![]
                };
                let reply = Envelope {
                    topic: inbound.topic,
                    event: event::REPLY.to_string(),
                    reference: inbound.reference,
                    payload: serde_json::to_value(claim_reply(runs)).unwrap(),
                };
                if remote.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let config = ClaimConfig {
            max_claim: 2,
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        };
        let pool: Arc<dyn SandboxPool> = Arc::new(InlinePool::detached(2));
        let claim_loop = ClaimLoop::start(config, channel, pool, claimed_tx);

        let claimed = claimed_rx.recv().await.expect("claimed run");
        assert_eq!(claimed.id, "run-1");

        claim_loop.shutdown().await.expect("clean shutdown");
        assert!(claims_seen.load(Ordering::SeqCst) >= 1);
        peer.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_further_claims() {
        let (local, mut remote) = MemoryTransport::pair();
        let channel = Channel::spawn(local);
        let (claimed_tx, _claimed_rx) = mpsc::channel(8);

        let claims_seen = Arc::new(AtomicUsize::new(0));
        let peer_claims = Arc::clone(&claims_seen);
        let peer = tokio::spawn(async move {
            loop {
                let Ok(Some(inbound)) = remote.recv().await else {
                    break;
                };
                peer_claims.fetch_add(1, Ordering::SeqCst);
                let reply = Envelope {
                    topic: inbound.topic,
                    event: event::REPLY.to_string(),
                    reference: inbound.reference,
                    payload: serde_json::to_value(claim_reply(vec![])).unwrap(),
                };
                if remote.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let config = ClaimConfig {
            max_claim: 1,
            backoff_min: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        };
        let pool: Arc<dyn SandboxPool> = Arc::new(InlinePool::detached(1));
        let claim_loop = ClaimLoop::start(config, channel, pool, claimed_tx);

        // Let at least one idle cycle happen, then stop.
        sleep(Duration::from_millis(30)).await;
        claim_loop.shutdown().await.expect("clean shutdown");

        let settled = claims_seen.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(claims_seen.load(Ordering::SeqCst), settled);
        peer.abort();
    }
}
