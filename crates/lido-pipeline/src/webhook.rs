//! Best-effort webhook delivery with HMAC-SHA256 signatures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use hmac::{Hmac, Mac};
use lido_storage::{BackoffPolicy, Store};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub subscription_id: i64,
    pub url: String,
    pub event: String,
    pub success: bool,
    pub attempts: usize,
    pub error: Option<String>,
}

/// Delivers pipeline events to matching active subscriptions. Delivery
/// failures are logged and swallowed; they never affect job state.
pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        timeout: Duration,
        max_retries: usize,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("lido-webhook/0.1")
            .build()
            .context("building webhook http client")?;
        Ok(Self {
            store,
            client,
            max_retries: max_retries.max(1),
            backoff: BackoffPolicy::default(),
        })
    }

    /// Hex HMAC-SHA256 of the payload under the subscription secret.
    pub fn sign(payload: &str, secret: &str) -> String {
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length; unreachable in practice.
            Err(_) => return String::new(),
        };
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Fan an event out to every active subscription whose filter
    /// matches. Returns per-target results for observability.
    pub async fn dispatch(&self, event: &str, data: JsonValue) -> Vec<DeliveryResult> {
        let subscriptions = match self.store.subscriptions().await {
            Ok(subs) => subs,
            Err(err) => {
                warn!(event, error = %err, "could not load webhook subscriptions");
                return Vec::new();
            }
        };
        let targets: Vec<_> = subscriptions.into_iter().filter(|s| s.wants(event)).collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let envelope = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        let body = envelope.to_string();

        let mut results = Vec::with_capacity(targets.len());
        for sub in targets {
            let result = self.deliver(&sub.url, event, &body, sub.secret.as_deref()).await;
            match &result {
                Ok(attempts) => {
                    info!(subscription_id = sub.id, event, attempts, "webhook delivered");
                    results.push(DeliveryResult {
                        subscription_id: sub.id,
                        url: sub.url,
                        event: event.to_string(),
                        success: true,
                        attempts: *attempts,
                        error: None,
                    });
                }
                Err(message) => {
                    warn!(subscription_id = sub.id, event, error = %message, "webhook delivery failed");
                    results.push(DeliveryResult {
                        subscription_id: sub.id,
                        url: sub.url,
                        event: event.to_string(),
                        success: false,
                        attempts: self.max_retries,
                        error: Some(message.clone()),
                    });
                }
            }
        }
        results
    }

    async fn deliver(
        &self,
        url: &str,
        event: &str,
        body: &str,
        secret: Option<&str>,
    ) -> Result<usize, String> {
        let mut last_error = String::from("no attempt made");
        for attempt in 0..self.max_retries {
            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Event", event)
                .body(body.to_string());
            if let Some(secret) = secret {
                request = request.header(
                    "X-Webhook-Signature",
                    format!("sha256={}", Self::sign(body, secret)),
                );
            }

            match request.send().await {
                Ok(resp) if resp.status().as_u16() < 400 => return Ok(attempt + 1),
                Ok(resp) => {
                    last_error = format!("http status {}", resp.status().as_u16());
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            if attempt + 1 < self.max_retries {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lido_core::WebhookSubscription;
    use lido_storage::MemoryStore;

    #[test]
    fn signature_is_deterministic_hex() {
        let sig = WebhookDispatcher::sign("{\"event\":\"job.completed\"}", "s3cret");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            sig,
            WebhookDispatcher::sign("{\"event\":\"job.completed\"}", "s3cret")
        );
        assert_ne!(sig, WebhookDispatcher::sign("{\"event\":\"job.completed\"}", "other"));
        assert_ne!(sig, WebhookDispatcher::sign("{\"event\":\"job.failed\"}", "s3cret"));
    }

    #[tokio::test]
    async fn dispatch_without_matching_subscriptions_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_subscription(WebhookSubscription {
                id: 0,
                url: "https://example.invalid/hook".into(),
                secret: None,
                events: vec!["job.failed".into()],
                active: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        // Inactive subscription with a matching filter.
        store
            .create_subscription(WebhookSubscription {
                id: 0,
                url: "https://example.invalid/hook2".into(),
                secret: None,
                events: vec!["job.completed".into()],
                active: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let dispatcher =
            WebhookDispatcher::new(store, Duration::from_secs(1), 1).expect("dispatcher");
        let results = dispatcher.dispatch("job.completed", json!({"job_id": 1})).await;
        assert!(results.is_empty());
    }
}
