//! NATS message producer for inference responses

use anyhow::Result;
use async_nats::Client;
use tracing::debug;

use crate::types::risk::InferenceResponse;

/// Producer for publishing inference responses to NATS
#[derive(Clone)]
pub struct ResponseProducer {
    client: Client,
    subject: String,
}

impl ResponseProducer {
    /// Create a new response producer
    pub fn new(client: Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    /// Publish a response on the configured result subject
    pub async fn publish(&self, response: &InferenceResponse) -> Result<()> {
        self.publish_to(&self.subject, response).await
    }

    /// Publish a response on an explicit subject, e.g. a request's reply inbox
    pub async fn publish_to(&self, subject: &str, response: &InferenceResponse) -> Result<()> {
        let payload = serde_json::to_vec(response)?;

        self.client
            .publish(subject.to_string(), payload.into())
            .await?;

        debug!(
            request_id = %response.request_id(),
            subject = %subject,
            success = response.is_success(),
            "Published inference response"
        );

        Ok(())
    }

    /// Get the subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

