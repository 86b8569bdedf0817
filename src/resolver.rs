//! Lazy dataclip and credential resolution.
//!
//! Input state and credentials are never pushed inline with claimed work;
//! the executor requests them by opaque id through resolver round-trips
//! over the run topic. A failed credential fetch aborts only the run that
//! needed it, surfaced as `CredentialLoadError`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::channel::Channel;
use crate::protocol::{event, run_topic};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to load dataclip {id}: {message}")]
    Dataclip { id: String, message: String },
    #[error("failed to load credential {id}: {message}")]
    Credential { id: String, message: String },
}

impl ResolveError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ResolveError::Dataclip { .. } => "DataclipLoadError",
            ResolveError::Credential { .. } => "CredentialLoadError",
        }
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn fetch_dataclip(&self, id: &str) -> Result<Value, ResolveError>;
    async fn fetch_credential(&self, id: &str) -> Result<Value, ResolveError>;
}

/// Resolver backed by the run's channel topic.
pub struct ChannelResolver {
    channel: Channel,
    topic: String,
}

impl ChannelResolver {
    pub fn new(channel: Channel, run_id: &str) -> Self {
        Self {
            channel,
            topic: run_topic(run_id),
        }
    }
}

#[async_trait]
impl Resolver for ChannelResolver {
    async fn fetch_dataclip(&self, id: &str) -> Result<Value, ResolveError> {
        self.channel
            .request(&self.topic, event::FETCH_DATACLIP, json!({ "id": id }))
            .await
            .map_err(|err| ResolveError::Dataclip {
                id: id.to_string(),
                message: err.to_string(),
            })
    }

    async fn fetch_credential(&self, id: &str) -> Result<Value, ResolveError> {
        self.channel
            .request(&self.topic, event::FETCH_CREDENTIAL, json!({ "id": id }))
            .await
            .map_err(|err| ResolveError::Credential {
                id: id.to_string(),
                message: err.to_string(),
            })
    }
}

/// Fixed-table resolver for tests.
#[derive(Default)]
pub struct StaticResolver {
    dataclips: HashMap<String, Value>,
    credentials: HashMap<String, Value>,
}

impl StaticResolver {
    pub fn with_dataclip(mut self, id: &str, body: Value) -> Self {
        self.dataclips.insert(id.to_string(), body);
        self
    }

    pub fn with_credential(mut self, id: &str, body: Value) -> Self {
        self.credentials.insert(id.to_string(), body);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn fetch_dataclip(&self, id: &str) -> Result<Value, ResolveError> {
        self.dataclips
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::Dataclip {
                id: id.to_string(),
                message: "not found".to_string(),
            })
    }

    async fn fetch_credential(&self, id: &str) -> Result<Value, ResolveError> {
        self.credentials
            .get(id)
            .cloned()
            .ok_or_else(|| ResolveError::Credential {
                id: id.to_string(),
                message: "not found".to_string(),
            })
    }
}
