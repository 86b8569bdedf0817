//! Run event publisher: turns executor progress into wire events on the
//! run topic.
//!
//! Step and log events are pushed fire-and-forget; run boundaries use
//! acknowledged requests so the orchestrator never loses a terminal state.
//! Every outbound log line passes through the run's [`Scrubber`] first.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::warn;

use crate::channel::Channel;
use crate::executor::{ExecEvent, RunReport};
use crate::protocol::{
    ChannelError, LogPayload, RunCompletePayload, StepCompletePayload, StepStartPayload, event,
    run_topic,
};
use crate::scrub::Scrubber;
use crate::state::RunState;

pub struct Publisher {
    channel: Channel,
    run_id: String,
    topic: String,
    scrubber: Arc<Scrubber>,
}

impl Publisher {
    pub fn new(channel: Channel, run_id: impl Into<String>, scrubber: Arc<Scrubber>) -> Self {
        let run_id = run_id.into();
        let topic = run_topic(&run_id);
        Self {
            channel,
            run_id,
            topic,
            scrubber,
        }
    }

    /// Announce that execution has begun. Acknowledged.
    pub async fn run_start(&self) -> Result<(), ChannelError> {
        self.channel
            .request(&self.topic, event::RUN_START, json!({}))
            .await?;
        Ok(())
    }

    /// Report the terminal verdict. Acknowledged.
    pub async fn run_complete(&self, report: &RunReport) -> Result<(), ChannelError> {
        let payload = RunCompletePayload {
            reason: report.reason,
            error_type: report.error.as_ref().map(|e| e.error_type.clone()),
            error_message: report
                .error
                .as_ref()
                .map(|e| self.scrubber.scrub(&e.message)),
            final_dataclip_id: report.final_dataclip_id.clone(),
        };
        self.channel
            .request(
                &self.topic,
                event::RUN_COMPLETE,
                serde_json::to_value(payload)?,
            )
            .await?;
        Ok(())
    }

    /// Drain executor events until the run is done and the sender drops.
    pub async fn pump(&self, mut events: mpsc::Receiver<ExecEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.publish(event).await {
                warn!(run_id = %self.run_id, %err, "failed to publish run event");
            }
        }
    }

    async fn publish(&self, event: ExecEvent) -> Result<(), ChannelError> {
        match event {
            ExecEvent::StepStart {
                job_id,
                step_id,
                input_dataclip_id,
                ..
            } => {
                let payload = StepStartPayload {
                    job_id,
                    step_id,
                    input_dataclip_id,
                };
                self.channel
                    .push(
                        &self.topic,
                        event::STEP_START,
                        serde_json::to_value(payload)?,
                    )
                    .await
            }
            ExecEvent::StepComplete {
                job_id,
                step_id,
                reason,
                error,
                duration_ms,
                output,
                output_dataclip_id,
            } => {
                let payload = StepCompletePayload {
                    job_id,
                    step_id,
                    reason,
                    error_type: error.as_ref().map(|e| e.error_type.clone()),
                    error_message: error.as_ref().map(|e| self.scrubber.scrub(&e.message)),
                    duration: duration_ms,
                    output_dataclip: output.map(|state| self.dataclip(&state)),
                    output_dataclip_id,
                };
                self.channel
                    .push(
                        &self.topic,
                        event::STEP_COMPLETE,
                        serde_json::to_value(payload)?,
                    )
                    .await
            }
            ExecEvent::Log {
                step_id,
                level,
                message,
            } => self.log(step_id, &level, &message).await,
        }
    }

    /// Publish one log line attributed to this run.
    pub async fn log(
        &self,
        step_id: Option<String>,
        level: &str,
        message: &str,
    ) -> Result<(), ChannelError> {
        let payload = LogPayload {
            run_id: self.run_id.clone(),
            step_id,
            level: level.to_string(),
            message: self.scrubber.scrub(message),
            timestamp: Utc::now(),
        };
        self.channel
            .push(&self.topic, event::LOG, serde_json::to_value(payload)?)
            .await
    }

    fn dataclip(&self, state: &RunState) -> Value {
        serde_json::to_value(state).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Reason, Reply};
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;

    async fn next_event(transport: &mut MemoryTransport) -> Envelope {
        transport.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn step_events_carry_the_wire_payload() {
        let (local, mut remote) = MemoryTransport::pair();
        let channel = Channel::spawn(local);
        let publisher = Publisher::new(channel, "r1", Arc::new(Scrubber::default()));

        let (tx, rx) = mpsc::channel(8);
        tx.send(ExecEvent::StepStart {
            job_id: "a".to_string(),
            step_id: "exec-1".to_string(),
            input: RunState::new(json!({})),
            input_dataclip_id: Some("clip-0".to_string()),
        })
        .await
        .unwrap();
        drop(tx);
        publisher.pump(rx).await;

        let envelope = next_event(&mut remote).await;
        assert_eq!(envelope.topic, "run:r1");
        assert_eq!(envelope.event, event::STEP_START);
        assert_eq!(envelope.payload["job_id"], json!("a"));
        assert_eq!(envelope.payload["input_dataclip_id"], json!("clip-0"));
    }

    #[tokio::test]
    async fn log_lines_are_scrubbed() {
        let (local, mut remote) = MemoryTransport::pair();
        let channel = Channel::spawn(local);
        let scrubber = Arc::new(Scrubber::default());
        scrubber.add_secrets(&json!({"token": "tok_secret"}));
        let publisher = Publisher::new(channel, "r2", scrubber);

        publisher
            .log(Some("a".to_string()), "info", "posting with tok_secret")
            .await
            .unwrap();

        let envelope = next_event(&mut remote).await;
        assert_eq!(envelope.event, event::LOG);
        assert_eq!(envelope.payload["message"], json!("posting with ***"));
    }

    #[tokio::test]
    async fn run_complete_is_acknowledged() {
        let (local, mut remote) = MemoryTransport::pair();
        let channel = Channel::spawn(local);
        let publisher = Publisher::new(channel, "r3", Arc::new(Scrubber::default()));

        let peer = tokio::spawn(async move {
            let inbound = remote.recv().await.unwrap().unwrap();
            assert_eq!(inbound.event, event::RUN_COMPLETE);
            assert_eq!(inbound.payload["reason"], json!("success"));
            remote
                .send(Envelope {
                    topic: inbound.topic,
                    event: event::REPLY.to_string(),
                    reference: inbound.reference,
                    payload: serde_json::to_value(Reply::ok(json!({}))).unwrap(),
                })
                .await
                .unwrap();
        });

        publisher
            .run_complete(&RunReport {
                reason: Reason::Success,
                error: None,
                final_state: Some(RunState::new(json!({}))),
                final_dataclip_id: Some("clip-9".to_string()),
            })
            .await
            .expect("run complete ack");
        peer.await.unwrap();
    }
}
