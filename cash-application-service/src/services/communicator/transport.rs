//! Transport capability: the communicator renders, a transport delivers.

use crate::models::CommunicationKind;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize)]
pub struct RenderedMessage {
    pub kind: CommunicationKind,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not enabled")]
    NotEnabled,

    #[error("delivery failed: {0}")]
    SendFailed(String),

    #[error("transport connection failed: {0}")]
    Connection(String),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver a rendered message; returns a provider reference.
    async fn deliver(&self, message: &RenderedMessage) -> Result<String, TransportError>;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Hands messages to an external relay over a webhook.
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url,
        }
    }
}

#[async_trait]
impl MessageTransport for WebhookTransport {
    async fn deliver(&self, message: &RenderedMessage) -> Result<String, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!(
                "relay returned {}",
                response.status()
            )));
        }

        let reference = response
            .headers()
            .get("x-delivery-ref")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| "webhook".to_string());

        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "Message relayed"
        );

        Ok(reference)
    }
}

/// Mock transport for testing
pub struct MockTransport {
    enabled: bool,
    sent: Mutex<Vec<RenderedMessage>>,
    send_count: AtomicU64,
}

impl MockTransport {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sent: Mutex::new(Vec::new()),
            send_count: AtomicU64::new(0),
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<RenderedMessage> {
        self.sent.lock().expect("mock transport lock").clone()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn deliver(&self, message: &RenderedMessage) -> Result<String, TransportError> {
        if !self.enabled {
            return Err(TransportError::NotEnabled);
        }

        self.send_count.fetch_add(1, Ordering::SeqCst);
        self.sent
            .lock()
            .expect("mock transport lock")
            .push(message.clone());

        tracing::info!(
            recipient = %message.recipient,
            subject = %message.subject,
            "[MOCK] Message would be delivered"
        );

        Ok(format!(
            "mock-delivery-{}",
            self.send_count.load(Ordering::SeqCst)
        ))
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}
