//! In-app purchase receipt validation
//!
//! Alternate purchase path for mobile store subscriptions. A validated
//! receipt feeds the same subscription record transition as card checkout,
//! under a synthetic subscription id namespaced by platform, so both paths
//! converge on the one live record per account.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use gigmatch_shared::SubscriptionTier;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::subscriptions::{SubscriptionRecord, SubscriptionService};

/// Mobile store platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IapPlatform {
    Apple,
    Google,
}

impl std::fmt::Display for IapPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apple => write!(f, "apple"),
            Self::Google => write!(f, "google"),
        }
    }
}

impl std::str::FromStr for IapPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "apple" | "ios" => Ok(Self::Apple),
            "google" | "android" => Ok(Self::Google),
            _ => Err(format!("Unknown IAP platform: {}", s)),
        }
    }
}

/// Store product ids and the plans they map to
const PRODUCT_PLANS: &[(&str, SubscriptionTier, bool)] = &[
    ("com.gigmatch.pro.monthly", SubscriptionTier::Pro, false),
    ("com.gigmatch.pro.yearly", SubscriptionTier::Pro, true),
    ("com.gigmatch.premium.monthly", SubscriptionTier::Premium, false),
    ("com.gigmatch.premium.yearly", SubscriptionTier::Premium, true),
];

/// Resolve a store product id to a (tier, yearly) plan
pub fn plan_for_product(product_id: &str) -> Option<(SubscriptionTier, bool)> {
    PRODUCT_PLANS
        .iter()
        .find(|(id, _, _)| *id == product_id)
        .map(|(_, tier, yearly)| (*tier, *yearly))
}

/// Synthetic subscription id for a store purchase. The platform namespace
/// guarantees it cannot collide with processor subscription ids.
pub fn synthetic_subscription_id(platform: IapPlatform, transaction_id: &str) -> String {
    format!("iap:{}:{}", platform, transaction_id)
}

/// IAP store endpoint configuration
#[derive(Debug, Clone)]
pub struct IapConfig {
    pub apple_verify_url: String,
    pub apple_shared_secret: String,
    pub google_verify_url: String,
    pub google_access_token: String,
}

impl IapConfig {
    pub fn from_env() -> Self {
        Self {
            apple_verify_url: std::env::var("IAP_APPLE_VERIFY_URL")
                .unwrap_or_else(|_| "https://buy.itunes.apple.com/verifyReceipt".to_string()),
            apple_shared_secret: std::env::var("IAP_APPLE_SHARED_SECRET").unwrap_or_default(),
            google_verify_url: std::env::var("IAP_GOOGLE_VERIFY_URL").unwrap_or_else(|_| {
                "https://androidpublisher.googleapis.com/androidpublisher/v3".to_string()
            }),
            google_access_token: std::env::var("IAP_GOOGLE_ACCESS_TOKEN").unwrap_or_default(),
        }
    }
}

/// Normalized outcome of a store verification call
#[derive(Debug, Clone)]
pub struct StoreVerification {
    pub product_id: String,
    pub transaction_id: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct AppleVerifyResponse {
    status: i64,
    latest_receipt_info: Option<Vec<AppleReceiptInfo>>,
}

#[derive(Debug, Deserialize)]
struct AppleReceiptInfo {
    product_id: String,
    original_transaction_id: String,
    expires_date_ms: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleVerifyResponse {
    product_id: String,
    order_id: String,
    /// 0 = purchased, 1 = canceled, 2 = pending
    purchase_state: Option<i64>,
    expiry_time_millis: Option<String>,
}

fn millis_to_ts(millis: &str) -> Option<OffsetDateTime> {
    let ms: i64 = millis.parse().ok()?;
    OffsetDateTime::from_unix_timestamp(ms / 1000).ok()
}

/// IAP receipt validation service
pub struct IapService {
    stripe: StripeClient,
    pool: PgPool,
    config: IapConfig,
    client: reqwest::Client,
}

impl IapService {
    pub fn new(stripe: StripeClient, pool: PgPool, config: IapConfig) -> Self {
        Self {
            stripe,
            pool,
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env(stripe: StripeClient, pool: PgPool) -> Self {
        Self::new(stripe, pool, IapConfig::from_env())
    }

    /// Validate a store receipt and apply the subscription transition.
    ///
    /// Unknown or expired purchases are rejected, never silently accepted.
    /// A receipt already attached to a different account is a conflict.
    pub async fn validate_receipt(
        &self,
        account_id: Uuid,
        platform: IapPlatform,
        receipt: &str,
    ) -> BillingResult<SubscriptionRecord> {
        if receipt.trim().is_empty() {
            return Err(BillingError::InvalidInput("Empty receipt".to_string()));
        }

        let verification = self.verify_with_store(platform, receipt).await?;

        if let Some(expires_at) = verification.expires_at {
            if expires_at <= OffsetDateTime::now_utc() {
                return Err(BillingError::InvalidInput(format!(
                    "Purchase {} is expired",
                    verification.product_id
                )));
            }
        }

        let (tier, yearly) = plan_for_product(&verification.product_id).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Unknown store product: {}",
                verification.product_id
            ))
        })?;

        let synthetic_id = synthetic_subscription_id(platform, &verification.transaction_id);

        // A purchase may only ever be attached to one account
        let owner: Option<(Uuid,)> =
            sqlx::query_as("SELECT account_id FROM subscriptions WHERE stripe_subscription_id = $1")
                .bind(&synthetic_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((existing,)) = owner {
            if existing != account_id {
                return Err(BillingError::Conflict(
                    "Purchase is already attached to another account".to_string(),
                ));
            }
        }

        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        let record = subscriptions
            .activate_external(account_id, tier, yearly, &synthetic_id, verification.expires_at)
            .await?;

        let event_logger = BillingEventLogger::new(self.pool.clone());
        if let Err(e) = event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::ReceiptValidated)
                    .data(serde_json::json!({
                        "platform": platform.to_string(),
                        "product_id": verification.product_id,
                        "tier": tier.to_string(),
                    }))
                    .stripe_subscription(&synthetic_id)
                    .actor_type(ActorType::Store),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log receipt validated event");
        }

        tracing::info!(
            account_id = %account_id,
            platform = %platform,
            product_id = %verification.product_id,
            tier = %tier,
            "Validated store receipt"
        );

        Ok(record)
    }

    /// Call the store's verification endpoint with bounded retries.
    async fn verify_with_store(
        &self,
        platform: IapPlatform,
        receipt: &str,
    ) -> BillingResult<StoreVerification> {
        let retry_strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);

        match platform {
            IapPlatform::Apple => {
                let body = serde_json::json!({
                    "receipt-data": receipt,
                    "password": self.config.apple_shared_secret,
                    "exclude-old-transactions": true,
                });

                let response = Retry::spawn(retry_strategy, || async {
                    self.client
                        .post(&self.config.apple_verify_url)
                        .json(&body)
                        .send()
                        .await?
                        .error_for_status()
                })
                .await?;

                let parsed: AppleVerifyResponse = response.json().await?;

                // Apple status 0 is valid; 21006 means the latest receipt
                // has expired; everything else is an invalid receipt.
                match parsed.status {
                    0 => {}
                    21006 => {
                        return Err(BillingError::InvalidInput(
                            "Receipt is expired".to_string(),
                        ))
                    }
                    status => {
                        return Err(BillingError::InvalidInput(format!(
                            "Store rejected receipt (status {})",
                            status
                        )))
                    }
                }

                let info = parsed
                    .latest_receipt_info
                    .and_then(|mut infos| infos.pop())
                    .ok_or_else(|| {
                        BillingError::InvalidInput("Receipt has no purchase info".to_string())
                    })?;

                Ok(StoreVerification {
                    expires_at: info.expires_date_ms.as_deref().and_then(millis_to_ts),
                    product_id: info.product_id,
                    transaction_id: info.original_transaction_id,
                })
            }
            IapPlatform::Google => {
                let url = format!("{}/purchases/subscriptions/verify", self.config.google_verify_url);
                let body = serde_json::json!({ "purchaseToken": receipt });

                let response = Retry::spawn(retry_strategy, || async {
                    self.client
                        .post(&url)
                        .header(
                            "Authorization",
                            format!("Bearer {}", self.config.google_access_token),
                        )
                        .json(&body)
                        .send()
                        .await?
                        .error_for_status()
                })
                .await?;

                let parsed: GoogleVerifyResponse = response.json().await?;

                if parsed.purchase_state != Some(0) {
                    return Err(BillingError::InvalidInput(format!(
                        "Store rejected purchase (state {:?})",
                        parsed.purchase_state
                    )));
                }

                Ok(StoreVerification {
                    expires_at: parsed.expiry_time_millis.as_deref().and_then(millis_to_ts),
                    product_id: parsed.product_id,
                    transaction_id: parsed.order_id,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_product() {
        assert_eq!(
            plan_for_product("com.gigmatch.pro.monthly"),
            Some((SubscriptionTier::Pro, false))
        );
        assert_eq!(
            plan_for_product("com.gigmatch.premium.yearly"),
            Some((SubscriptionTier::Premium, true))
        );
        assert_eq!(plan_for_product("com.other.app.product"), None);
    }

    #[test]
    fn test_synthetic_id_is_namespaced() {
        let apple = synthetic_subscription_id(IapPlatform::Apple, "1000000123");
        let google = synthetic_subscription_id(IapPlatform::Google, "1000000123");
        assert_eq!(apple, "iap:apple:1000000123");
        assert_eq!(google, "iap:google:1000000123");
        assert_ne!(apple, google);
        // Processor ids start with "sub_"; the namespace prevents collision
        assert!(apple.starts_with("iap:"));
    }

    #[test]
    fn test_platform_parsing() {
        assert_eq!("ios".parse::<IapPlatform>(), Ok(IapPlatform::Apple));
        assert_eq!("android".parse::<IapPlatform>(), Ok(IapPlatform::Google));
        assert!("windows".parse::<IapPlatform>().is_err());
    }

    #[test]
    fn test_millis_parsing() {
        let ts = millis_to_ts("1700000000000").unwrap();
        assert_eq!(ts.unix_timestamp(), 1_700_000_000);
        assert!(millis_to_ts("not-a-number").is_none());
    }
}
