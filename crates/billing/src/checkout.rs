//! Stripe Checkout sessions
//!
//! Initiates purchases through processor-hosted checkout and verifies
//! completion. Verification is all-or-nothing: an unpaid session never
//! mutates local state, and re-verifying a paid session cannot double-apply
//! entitlements or duplicate invoices.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionPaymentStatus, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, Subscription,
};
use uuid::Uuid;

use gigmatch_shared::SubscriptionTier;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::InvoiceService;
use crate::subscriptions::SubscriptionService;

/// Billing interval for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn is_yearly(&self) -> bool {
        *self == Self::Yearly
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "annual" | "year" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// Response for creating a checkout session
#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

impl From<CheckoutSession> for CheckoutResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            session_id: session.id.to_string(),
            url: session.url,
        }
    }
}

/// Outcome of verifying a checkout session
#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Session exists but has not been paid yet; callers may poll
    Pending,
    /// Payment confirmed and the subscription record updated
    Completed {
        tier: SubscriptionTier,
        subscription_id: String,
    },
}

/// Checkout service for creating and verifying Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a hosted checkout session for a new subscription
    pub async fn create_checkout(
        &self,
        account_id: Uuid,
        email: &str,
        name: &str,
        tier: SubscriptionTier,
        interval: BillingInterval,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutResponse> {
        let price_id = self
            .stripe
            .config()
            .price_id_for_tier(tier, interval.is_yearly())
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?
            .to_string();

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers
            .get_or_create_customer(account_id, email, name)
            .await?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("tier".to_string(), tier.to_string());

        let params = CreateCheckoutSession {
            customer: Some(customer.id.clone()),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(success_url),
            cancel_url: Some(cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Auto),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            account_id = %account_id,
            session_id = %session.id,
            tier = %tier,
            interval = ?interval,
            "Created checkout session"
        );

        Ok(session.into())
    }

    /// Verify a checkout session and, if paid, apply the subscription
    /// transition and append the invoice record.
    ///
    /// Idempotent: verifying an already-verified session re-applies the same
    /// processor state (a no-op) and the invoice upsert is keyed on the
    /// external invoice id.
    pub async fn verify_checkout(&self, session_id: &str) -> BillingResult<CheckoutOutcome> {
        let session = self.get_session(session_id).await?;

        if session.payment_status != CheckoutSessionPaymentStatus::Paid {
            tracing::info!(
                session_id = %session_id,
                payment_status = ?session.payment_status,
                "Checkout session not paid yet"
            );
            return Ok(CheckoutOutcome::Pending);
        }

        let account_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("account_id"))
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                BillingError::Internal("account_id not found in session metadata".to_string())
            })?;

        let subscription_id = session
            .subscription
            .as_ref()
            .map(|s| s.id())
            .ok_or_else(|| {
                BillingError::Internal("No subscription on paid checkout session".to_string())
            })?;

        let parsed_sub_id = subscription_id.as_str().parse().map_err(|e| {
            BillingError::Internal(format!("Invalid subscription ID: {}", e))
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

        let record = SubscriptionService::new(self.stripe.clone(), self.pool.clone())
            .apply_processor_state(account_id, &subscription)
            .await?;

        // Append the invoice ledger row for the session's invoice. The
        // unique external id makes a duplicate verify a no-op.
        if let Some(invoice) = &session.invoice {
            let invoices = InvoiceService::new(self.pool.clone());
            invoices
                .record_paid_checkout(
                    account_id,
                    invoice.id().as_str(),
                    session.amount_total.unwrap_or(0),
                    "Subscription checkout",
                )
                .await?;
        }

        let event_logger = BillingEventLogger::new(self.pool.clone());
        if let Err(e) = event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::CheckoutCompleted)
                    .data(serde_json::json!({
                        "session_id": session.id.to_string(),
                        "tier": record.tier.to_string(),
                        "amount_total_cents": session.amount_total,
                    }))
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log checkout completed event");
        }

        tracing::info!(
            account_id = %account_id,
            session_id = %session_id,
            tier = %record.tier,
            "Checkout verified"
        );

        Ok(CheckoutOutcome::Completed {
            tier: record.tier,
            subscription_id: subscription.id.to_string(),
        })
    }

    /// Retrieve a checkout session by ID
    pub async fn get_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let session_id = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid session ID: {}", e)))?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &session_id, &[]).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_interval_parsing() {
        assert_eq!(BillingInterval::from_str("monthly"), Some(BillingInterval::Monthly));
        assert_eq!(BillingInterval::from_str("Yearly"), Some(BillingInterval::Yearly));
        assert_eq!(BillingInterval::from_str("annual"), Some(BillingInterval::Yearly));
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }

    #[test]
    fn test_interval_is_yearly() {
        assert!(BillingInterval::Yearly.is_yearly());
        assert!(!BillingInterval::Monthly.is_yearly());
    }
}
