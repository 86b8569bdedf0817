//! The connected orchestrator channel.
//!
//! One pump task owns the transport; callers interact through a cloneable
//! handle. Requests allocate a monotonically increasing `ref`, park a
//! oneshot sender in the pending map, and are completed when the matching
//! reply envelope arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::{ChannelError, Envelope, Reply, event};
use crate::transport::Transport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

#[derive(Clone)]
pub struct Channel {
    out_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
    next_ref: Arc<AtomicU64>,
}

impl Channel {
    /// Spawn the pump task over a connected transport.
    pub fn spawn(mut transport: impl Transport + 'static) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pump_pending = Arc::clone(&pending);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(envelope) => {
                            if let Err(err) = transport.send(envelope).await {
                                warn!(%err, "channel send failed; closing pump");
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = transport.recv() => match inbound {
                        Ok(Some(envelope)) => {
                            route_inbound(&pump_pending, envelope).await;
                        }
                        Ok(None) => {
                            debug!("orchestrator closed the channel");
                            break;
                        }
                        Err(err) => {
                            warn!(%err, "channel receive failed; closing pump");
                            break;
                        }
                    },
                }
            }
            // Wake every parked requester with a closed error path.
            pump_pending.lock().await.clear();
        });

        Self {
            out_tx,
            pending,
            next_ref: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Join a topic, presenting the payload (credential token for the
    /// worker topic). Rejection is terminal for the caller.
    pub async fn join(&self, topic: &str, payload: Value) -> Result<Value, ChannelError> {
        match self.request(topic, event::JOIN, payload).await {
            Ok(response) => Ok(response),
            Err(ChannelError::RequestFailed { message, .. }) => {
                Err(ChannelError::JoinRejected {
                    topic: topic.to_string(),
                    message,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Round-trip request; resolves with the reply's `response` value.
    pub async fn request(
        &self,
        topic: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<Value, ChannelError> {
        let reference = self.next_ref.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(reference, reply_tx);

        let envelope = Envelope {
            topic: topic.to_string(),
            event: event_name.to_string(),
            reference: Some(reference),
            payload,
        };
        if self.out_tx.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&reference);
            return Err(ChannelError::Closed);
        }

        let reply = match timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&reference);
                return Err(ChannelError::RequestTimeout(event_name.to_string()));
            }
        };

        if reply.status == "ok" {
            Ok(reply.response)
        } else {
            Err(ChannelError::RequestFailed {
                event: event_name.to_string(),
                message: reply
                    .response
                    .as_str()
                    .unwrap_or("request rejected")
                    .to_string(),
            })
        }
    }

    /// Fire-and-forget event.
    pub async fn push(
        &self,
        topic: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<(), ChannelError> {
        let envelope = Envelope {
            topic: topic.to_string(),
            event: event_name.to_string(),
            reference: None,
            payload,
        };
        self.out_tx
            .send(envelope)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

async fn route_inbound(pending: &PendingMap, envelope: Envelope) {
    if envelope.event != event::REPLY {
        debug!(event = %envelope.event, topic = %envelope.topic, "ignoring unsolicited event");
        return;
    }
    let Some(reference) = envelope.reference else {
        warn!("reply envelope without a ref");
        return;
    };
    let Some(waiter) = pending.lock().await.remove(&reference) else {
        warn!(reference, "orphan reply");
        return;
    };
    let reply: Reply = match serde_json::from_value(envelope.payload) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, reference, "malformed reply payload");
            Reply::error("malformed reply payload")
        }
    };
    let _ = waiter.send(reply);
}
