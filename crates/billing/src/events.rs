//! Billing event ledger
//!
//! Append-only log of billing operations for audit trails and debugging.
//! Events answer "why is this account on this tier?" and make billing
//! history reconstructable after the fact.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,

    // Tier changes
    TierChanged,

    // Trial
    TrialStarted,
    TrialEnding,

    // Invoicing
    InvoicePaid,
    InvoiceFailed,

    // Dunning
    PaymentRetryScheduled,
    PaymentRetryExhausted,

    // Purchase paths
    CheckoutCompleted,
    ReceiptValidated,

    // Customer lifecycle
    CustomerCreated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::TierChanged => "TIER_CHANGED",
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::TrialEnding => "TRIAL_ENDING",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoiceFailed => "INVOICE_FAILED",
            BillingEventType::PaymentRetryScheduled => "PAYMENT_RETRY_SCHEDULED",
            BillingEventType::PaymentRetryExhausted => "PAYMENT_RETRY_EXHAUSTED",
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::ReceiptValidated => "RECEIPT_VALIDATED",
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
    /// Mobile store receipt validation
    Store,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
            ActorType::Store => write!(f, "store"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub account_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    account_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_invoice_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(account_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            account_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_invoice_id: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.stripe_invoice_id = Some(invoice_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying billing events
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a billing event. Failures here never fail the parent operation;
    /// callers log a warning and continue.
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                account_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_invoice_id,
                stripe_subscription_id,
                stripe_customer_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(builder.account_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_invoice_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.stripe_customer_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Get recent events for an account
    pub async fn get_events_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT
                id,
                account_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_invoice_id,
                stripe_subscription_id,
                stripe_customer_id,
                actor_type,
                created_at
            FROM billing_events
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillingEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            stripe_event_id: row.try_get("stripe_event_id")?,
            stripe_invoice_id: row.try_get("stripe_invoice_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(
            BillingEventType::SubscriptionCreated.to_string(),
            "SUBSCRIPTION_CREATED"
        );
        assert_eq!(BillingEventType::TierChanged.to_string(), "TIER_CHANGED");
        assert_eq!(
            BillingEventType::PaymentRetryExhausted.to_string(),
            "PAYMENT_RETRY_EXHAUSTED"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
        assert_eq!(ActorType::Store.to_string(), "store");
    }

    #[test]
    fn test_event_builder() {
        let account_id = Uuid::new_v4();
        let builder = BillingEventBuilder::new(account_id, BillingEventType::TierChanged)
            .data(serde_json::json!({"from": "pro", "to": "premium"}))
            .stripe_subscription("sub_123")
            .actor_type(ActorType::User);

        assert_eq!(builder.account_id, account_id);
        assert_eq!(builder.event_type, BillingEventType::TierChanged);
        assert_eq!(builder.stripe_subscription_id, Some("sub_123".to_string()));
        assert_eq!(builder.actor_type, ActorType::User);
    }
}
