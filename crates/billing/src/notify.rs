//! Billing notifications
//!
//! Fire-and-forget calls to the platform notification service. Delivery,
//! retries, and multicast are the notification service's concern; this
//! client posts once and never fails the calling operation.

use uuid::Uuid;

use crate::error::BillingResult;

/// Notification service configuration
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Base URL of the notification service
    pub base_url: String,
    /// Service-to-service auth token
    pub api_token: String,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("NOTIFICATION_SERVICE_URL").unwrap_or_default(),
            api_token: std::env::var("NOTIFICATION_SERVICE_TOKEN").unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.base_url.is_empty()
    }
}

/// Client for the platform notification service
#[derive(Clone)]
pub struct NotificationClient {
    config: NotifyConfig,
    client: reqwest::Client,
}

impl NotificationClient {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(NotifyConfig::from_env())
    }

    /// Post a notification.
    ///
    /// Returns `Ok(true)` if accepted by the notification service,
    /// `Ok(false)` if sending failed or notifications are unconfigured.
    /// Never returns an error: billing transitions must not fail because a
    /// notice could not be delivered.
    async fn send(
        &self,
        account_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::debug!(
                account_id = %account_id,
                kind = %kind,
                "Notification service not configured, skipping"
            );
            return Ok(false);
        }

        let body = serde_json::json!({
            "account_id": account_id,
            "kind": kind,
            "payload": payload,
        });

        let url = format!("{}/internal/notifications", self.config.base_url);
        let result = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_token))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                tracing::warn!(
                    account_id = %account_id,
                    kind = %kind,
                    status = %response.status(),
                    "Notification service rejected notice"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(
                    account_id = %account_id,
                    kind = %kind,
                    error = %e,
                    "Failed to reach notification service"
                );
                Ok(false)
            }
        }
    }

    pub async fn payment_failed(
        &self,
        account_id: Uuid,
        amount_cents: i64,
        attempt: i32,
    ) -> BillingResult<bool> {
        self.send(
            account_id,
            "billing.payment_failed",
            serde_json::json!({ "amount_cents": amount_cents, "attempt": attempt }),
        )
        .await
    }

    pub async fn subscription_renewed(
        &self,
        account_id: Uuid,
        amount_cents: i64,
    ) -> BillingResult<bool> {
        self.send(
            account_id,
            "billing.subscription_renewed",
            serde_json::json!({ "amount_cents": amount_cents }),
        )
        .await
    }

    pub async fn trial_ending(&self, account_id: Uuid, days_remaining: i64) -> BillingResult<bool> {
        self.send(
            account_id,
            "billing.trial_ending",
            serde_json::json!({ "days_remaining": days_remaining }),
        )
        .await
    }

    pub async fn subscription_canceled(&self, account_id: Uuid) -> BillingResult<bool> {
        self.send(account_id, "billing.subscription_canceled", serde_json::json!({}))
            .await
    }

    pub async fn subscription_downgraded(
        &self,
        account_id: Uuid,
        reason: &str,
    ) -> BillingResult<bool> {
        self.send(
            account_id,
            "billing.subscription_downgraded",
            serde_json::json!({ "reason": reason }),
        )
        .await
    }
}
