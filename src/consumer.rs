//! NATS message consumer for incoming inference requests

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::info;

use crate::types::request::InferenceRequest;

/// Consumer for receiving scoring requests from NATS
pub struct RequestConsumer {
    client: Client,
    subject: String,
}

impl RequestConsumer {
    /// Create a new request consumer
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Subscribe to the request subject
    pub async fn subscribe(&self) -> Result<Subscriber> {
        let subscriber = self.client.subscribe(self.subject.clone()).await?;
        info!(subject = %self.subject, "Subscribed to request subject");
        Ok(subscriber)
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Decode a request payload
pub fn decode_request(payload: &[u8]) -> Result<InferenceRequest, serde_json::Error> {
    serde_json::from_slice(payload)
}
