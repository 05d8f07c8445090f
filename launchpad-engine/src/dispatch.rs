//! Notification dispatch: best-effort fan-out to chat/webhook transports.
//!
//! Delivery never gates a state change. Each transport gets a bounded
//! number of attempts with doubling backoff; after the last failure the
//! dispatcher writes an audit entry and moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use launchpad_models::{AuditEntry, Error, Result, SubjectKind};

use crate::store::RequestStore;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// What happened, for subject lines and card colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ApprovalRequested,
    Approved,
    Rejected,
    Completed,
    Failed,
    ApprovalReminder,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ApprovalRequested => "approval_requested",
            NotificationKind::Approved => "approved",
            NotificationKind::Rejected => "rejected",
            NotificationKind::Completed => "completed",
            NotificationKind::Failed => "failed",
            NotificationKind::ApprovalReminder => "approval_reminder",
        }
    }

    fn theme_color(&self) -> &'static str {
        match self {
            NotificationKind::ApprovalRequested | NotificationKind::ApprovalReminder => "FFA500",
            NotificationKind::Approved | NotificationKind::Completed => "2EB886",
            NotificationKind::Rejected | NotificationKind::Failed => "D63333",
        }
    }
}

/// A transport-agnostic notification.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub subject_kind: SubjectKind,
    pub subject_id: Uuid,
    pub summary: String,
    pub facts: Vec<(String, String)>,
    pub link: Option<String>,
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, event: &NotificationEvent) -> Result<()>;
}

/// Posts MessageCard payloads to an incoming webhook.
pub struct WebhookTransport {
    http: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::NotificationDelivery(format!("failed to build client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

fn message_card(event: &NotificationEvent) -> serde_json::Value {
    let facts: Vec<serde_json::Value> = event
        .facts
        .iter()
        .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
        .collect();

    let mut card = serde_json::json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": event.kind.theme_color(),
        "summary": event.summary,
        "sections": [{
            "activityTitle": event.summary,
            "facts": facts,
            "markdown": true,
        }],
    });

    if let Some(link) = &event.link {
        card["potentialAction"] = serde_json::json!([{
            "@type": "OpenUri",
            "name": "Open in portal",
            "targets": [{ "os": "default", "uri": link }],
        }]);
    }

    card
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.url)
            .json(&message_card(event))
            .send()
            .await
            .map_err(|e| Error::NotificationDelivery(format!("webhook post failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::NotificationDelivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fans events out to every configured transport.
pub struct Dispatcher {
    store: Arc<dyn RequestStore>,
    transports: Vec<Arc<dyn NotificationTransport>>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RequestStore>,
        transports: Vec<Arc<dyn NotificationTransport>>,
    ) -> Self {
        Self {
            store,
            transports,
            max_attempts: MAX_ATTEMPTS,
            base_backoff: BASE_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Appends an audit entry. Storage trouble is logged and swallowed;
    /// recording never fails the transition that produced the entry.
    pub async fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.store.append_audit(&entry).await {
            tracing::error!(
                subject = %entry.subject_id,
                action = %entry.action,
                "failed to record audit entry: {err}"
            );
        }
    }

    /// Delivers `event` to every transport. Always returns; delivery
    /// failures are logged and audited, never propagated.
    pub async fn notify(&self, event: NotificationEvent) {
        for transport in &self.transports {
            let mut backoff = self.base_backoff;
            let mut delivered = false;

            for attempt in 1..=self.max_attempts {
                match transport.send(&event).await {
                    Ok(()) => {
                        tracing::debug!(
                            transport = transport.name(),
                            kind = event.kind.as_str(),
                            subject = %event.subject_id,
                            "notification delivered"
                        );
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            transport = transport.name(),
                            kind = event.kind.as_str(),
                            subject = %event.subject_id,
                            attempt,
                            "notification attempt failed: {err}"
                        );
                        if attempt < self.max_attempts {
                            tokio::time::sleep(backoff).await;
                            backoff *= 2;
                        }
                    }
                }
            }

            if !delivered {
                let entry = AuditEntry {
                    id: Uuid::new_v4(),
                    subject_kind: event.subject_kind,
                    subject_id: event.subject_id,
                    actor_email: "system".to_string(),
                    actor_name: "launchpad".to_string(),
                    action: "notification_delivery_failed".to_string(),
                    detail: serde_json::json!({
                        "transport": transport.name(),
                        "kind": event.kind.as_str(),
                        "attempts": self.max_attempts,
                    }),
                    created_at: Utc::now(),
                };
                if let Err(err) = self.store.append_audit(&entry).await {
                    tracing::error!(
                        subject = %event.subject_id,
                        "failed to audit dropped notification: {err}"
                    );
                }
            }
        }
    }
}
