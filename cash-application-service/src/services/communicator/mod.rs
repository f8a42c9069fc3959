//! Template-driven dispatch of customer and internal messages.
//!
//! The communicator renders a named template, applies a per-recipient
//! rate limit, retries delivery with exponential backoff and records the
//! outcome. Transport protocols live behind the `MessageTransport`
//! capability.

mod templates;
mod transport;

pub use templates::{render, Template, TemplateRegistry};
pub use transport::{MessageTransport, MockTransport, RenderedMessage, TransportError, WebhookTransport};

use crate::models::{CommunicationEvent, CommunicationKind, DeliveryStatus, NewAuditEvent};
use crate::services::metrics;
use crate::services::store::AuditStore;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::rate_limit::{create_keyed_rate_limiter, KeyedRateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub kind: CommunicationKind,
    pub recipient: String,
    pub template_name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub delivery_id: Uuid,
    pub status: DeliveryStatus,
}

pub struct Communicator {
    registry: TemplateRegistry,
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn AuditStore>,
    limiter: KeyedRateLimiter,
    delivery_cap: Duration,
}

impl Communicator {
    pub fn new(
        registry: TemplateRegistry,
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn AuditStore>,
        rate_per_recipient_per_min: u32,
        delivery_cap: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            store,
            limiter: create_keyed_rate_limiter(rate_per_recipient_per_min, 60),
            delivery_cap,
        }
    }

    /// Render and deliver one message. Template and payload problems are
    /// surfaced to the caller; delivery failures are absorbed into the
    /// recorded event after retries are exhausted.
    #[instrument(skip(self, request), fields(kind = %request.kind.as_str(), template = %request.template_name, recipient = %request.recipient))]
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, AppError> {
        let template = self.registry.get(&request.template_name).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "template not found: {}",
                request.template_name
            ))
        })?;

        let (subject, body) = render(template, &request.data)?;

        if self.limiter.check_key(&request.recipient).is_err() {
            metrics::record_dispatch(request.kind.as_str(), "throttled");
            return Err(AppError::TooManyRequests(
                format!("notification rate exceeded for {}", request.recipient),
                Some(60),
            ));
        }

        let event = CommunicationEvent::new(
            request.kind,
            request.recipient.clone(),
            request.template_name.clone(),
            request.data.clone(),
            request.transaction_id.clone(),
        );
        let delivery_id = event.id;
        self.store.record_communication(&event).await?;

        let message = RenderedMessage {
            kind: request.kind,
            recipient: request.recipient.clone(),
            subject,
            body,
            transaction_id: request.transaction_id.clone(),
        };

        if let Some(at) = request.scheduled_at {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            if !delay.is_zero() {
                info!(delivery_id = %delivery_id, delay_secs = delay.as_secs(), "Delivery scheduled");
                let this = self.clone_for_delayed_send();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.deliver_and_record(delivery_id, &message).await;
                });
                return Ok(DispatchReceipt {
                    delivery_id,
                    status: DeliveryStatus::Queued,
                });
            }
        }

        let status = self.deliver_and_record(delivery_id, &message).await;
        Ok(DispatchReceipt {
            delivery_id,
            status,
        })
    }

    fn clone_for_delayed_send(&self) -> DelayedSender {
        DelayedSender {
            transport: self.transport.clone(),
            store: self.store.clone(),
            delivery_cap: self.delivery_cap,
        }
    }

    async fn deliver_and_record(
        &self,
        delivery_id: Uuid,
        message: &RenderedMessage,
    ) -> DeliveryStatus {
        DelayedSender {
            transport: self.transport.clone(),
            store: self.store.clone(),
            delivery_cap: self.delivery_cap,
        }
        .deliver_and_record(delivery_id, message)
        .await
    }
}

/// The retained pieces needed to finish a delivery outside the dispatch
/// call, including scheduled sends.
struct DelayedSender {
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn AuditStore>,
    delivery_cap: Duration,
}

impl DelayedSender {
    async fn deliver_and_record(
        &self,
        delivery_id: Uuid,
        message: &RenderedMessage,
    ) -> DeliveryStatus {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.delivery_cap),
            ..Default::default()
        };

        let result = backoff::future::retry(backoff, || async {
            self.transport.deliver(message).await.map_err(|e| match e {
                TransportError::NotEnabled => backoff::Error::permanent(e),
                other => backoff::Error::transient(other),
            })
        })
        .await;

        match result {
            Ok(provider_ref) => {
                if let Err(e) = self
                    .store
                    .update_communication_status(delivery_id, DeliveryStatus::Sent, None)
                    .await
                {
                    error!(delivery_id = %delivery_id, error = %e, "Failed to record sent status");
                }
                let _ = self
                    .store
                    .append_audit(NewAuditEvent::new(
                        "communication.dispatched",
                        "communicator",
                        &delivery_id.to_string(),
                        message.transaction_id.as_deref(),
                        serde_json::json!({
                            "kind": message.kind.as_str(),
                            "recipient": message.recipient,
                            "provider_ref": provider_ref,
                        }),
                    ))
                    .await;
                metrics::record_dispatch(message.kind.as_str(), "sent");
                info!(delivery_id = %delivery_id, "Message delivered");
                DeliveryStatus::Sent
            }
            Err(e) => {
                warn!(delivery_id = %delivery_id, error = %e, "Delivery failed after retries");
                if let Err(e) = self
                    .store
                    .update_communication_status(
                        delivery_id,
                        DeliveryStatus::Failed,
                        Some(&e.to_string()),
                    )
                    .await
                {
                    error!(delivery_id = %delivery_id, error = %e, "Failed to record failed status");
                }
                let _ = self
                    .store
                    .append_audit(NewAuditEvent::new(
                        "communication.failed",
                        "communicator",
                        &delivery_id.to_string(),
                        message.transaction_id.as_deref(),
                        serde_json::json!({
                            "kind": message.kind.as_str(),
                            "recipient": message.recipient,
                            "error": e.to_string(),
                        }),
                    ))
                    .await;
                metrics::record_dispatch(message.kind.as_str(), "failed");
                DeliveryStatus::Failed
            }
        }
    }
}
