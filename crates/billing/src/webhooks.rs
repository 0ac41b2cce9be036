//! Stripe webhook handling
//!
//! Ingests signed processor events and applies them to subscription records
//! exactly once. The processed-event ledger's unique constraint is the
//! concurrency primitive: duplicate and out-of-order deliveries are safe to
//! replay. Business failures inside a verified event are logged and
//! acknowledged so the processor never redelivers indefinitely; only a
//! signature failure is surfaced to the HTTP layer.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::dunning::DunningService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::InvoiceService;
use crate::notify::NotificationClient;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp tolerance for webhook signatures
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Parse a `t=...,v1=...` signature header into (timestamp, v1 signature)
pub fn parse_signature_header(header: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    Some((timestamp?, v1_signature?))
}

/// Compute the expected HMAC-SHA256 signature over `timestamp.payload`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let signed_payload = format!("{}.{}", timestamp, payload);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    notify: NotificationClient,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, notify: NotificationClient) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            notify,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Verification runs against the raw, unparsed body. An empty configured
    /// secret skips verification for local testing; config loading refuses
    /// that combination in production, so the skip can never be silently
    /// enabled there.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        if webhook_secret.is_empty() {
            tracing::warn!(
                "Webhook signature verification DISABLED (no secret configured); \
                 accepting unverified event for local testing"
            );
            return serde_json::from_str(payload).map_err(|e| {
                tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
                BillingError::SignatureInvalid
            });
        }

        // Try the library verification first
        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Library webhook parsing failed, trying manual verification"
                );
            }
        }

        // Manual verification for API versions the library cannot parse
        let (timestamp, v1_signature) = parse_signature_header(signature).ok_or_else(|| {
            tracing::warn!("Malformed webhook signature header");
            BillingError::SignatureInvalid
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| BillingError::SignatureInvalid)?
            .as_secs() as i64;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let computed = compute_signature(webhook_secret, timestamp, payload)?;
        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::SignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Atomically claims the event id in the idempotency ledger; a duplicate
    /// returns success without reapplying effects. Business failures are
    /// recorded on the ledger row and swallowed; the error return is
    /// reserved for being unable to claim at all (the processor should
    /// redeliver in that case).
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events (stripe_event_id, event_type, processing_result)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, already processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type_str,
                    error = %e,
                    "Webhook business logic failed; acknowledging anyway for operator follow-up"
                );
                ("error".to_string(), Some(e.to_string()))
            }
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        // Deliberate availability-over-consistency tradeoff at the edge: the
        // event is acknowledged even when its effects failed, compensated by
        // the retry scheduler and the worker sweeps.
        Ok(())
    }

    /// Internal event dispatch
    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            // Subscription events
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_changed(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::CustomerSubscriptionTrialWillEnd => {
                self.handle_trial_will_end(event_owned).await?;
            }

            // Invoice events
            EventType::InvoicePaid => {
                self.handle_invoice_paid(event_owned).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event_owned).await?;
            }

            // Checkout events
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }

            _ => {
                // Acknowledged but unhandled; tracked so new event types
                // that need handlers show up in the logs
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    /// `customer.subscription.created` / `customer.subscription.updated`
    async fn handle_subscription_changed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let subscription = self.extract_subscription(event)?;
        let account_id = self.account_id_for_subscription(&subscription).await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        let record = sub_service
            .apply_processor_state(account_id, &subscription)
            .await?;

        // Keep the dunning cycle consistent with the processor-reported
        // status, whichever component observes the change first.
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        let dunning = DunningService::new(self.stripe.clone(), self.pool.clone(), self.notify.clone());
        match record.status {
            gigmatch_shared::SubscriptionStatus::Active
            | gigmatch_shared::SubscriptionStatus::Trialing => {
                dunning.reset(&customer_id).await?;
            }
            gigmatch_shared::SubscriptionStatus::PastDue => {
                dunning.schedule_retry(&customer_id, account_id).await?;
            }
            _ => {}
        }

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::SubscriptionUpdated)
                    .data(serde_json::json!({
                        "status": record.status.to_string(),
                        "tier": record.tier.to_string(),
                        "cancel_at_period_end": record.cancel_at_period_end,
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription updated event");
        }

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.id,
            status = %record.status,
            "Subscription state reconciled"
        );

        Ok(())
    }

    /// `customer.subscription.deleted` - terminal cancellation
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let subscription = self.extract_subscription(event)?;
        let account_id = self.account_id_for_subscription(&subscription).await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service
            .downgrade_to_free(account_id, "processor subscription deleted")
            .await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::SubscriptionCanceled)
                    .data(serde_json::json!({
                        "period_end": subscription.current_period_end,
                    }))
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription deleted event");
        }

        let _ = self.notify.subscription_canceled(account_id).await;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.id,
            "Subscription cancelled, downgraded to free tier"
        );

        Ok(())
    }

    async fn handle_trial_will_end(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let account_id = self.account_id_for_subscription(&subscription).await?;

        let days_remaining = subscription
            .trial_end
            .map(|end| {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                ((end - now) / 86_400).max(1)
            })
            .unwrap_or(3);

        let _ = self.notify.trial_ending(account_id, days_remaining).await;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.id,
            trial_end = ?subscription.trial_end,
            "Trial period ending soon"
        );

        Ok(())
    }

    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let invoice = self.extract_invoice(event)?;
        let (account_id, customer_id) = self.account_id_for_invoice(&invoice).await?;

        let invoices = InvoiceService::new(self.pool.clone());
        invoices
            .upsert_from_stripe(account_id, &invoice, "paid")
            .await?;

        // Any successful payment for the customer resets the dunning cycle
        let dunning = DunningService::new(self.stripe.clone(), self.pool.clone(), self.notify.clone());
        dunning.reset(&customer_id).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::InvoicePaid)
                    .data(serde_json::json!({
                        "amount_paid_cents": invoice.amount_paid,
                        "billing_reason": invoice.billing_reason.as_ref().map(|r| format!("{:?}", r)),
                    }))
                    .stripe_event(&event_id)
                    .stripe_invoice(invoice.id.as_str())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice paid event");
        }

        let _ = self
            .notify
            .subscription_renewed(account_id, invoice.amount_paid.unwrap_or(0))
            .await;

        tracing::info!(
            account_id = %account_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_paid,
            "Invoice paid"
        );

        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let invoice = self.extract_invoice(event)?;
        let (account_id, customer_id) = self.account_id_for_invoice(&invoice).await?;

        let invoices = InvoiceService::new(self.pool.clone());
        invoices
            .upsert_from_stripe(account_id, &invoice, "open")
            .await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service.mark_past_due(account_id).await?;

        let dunning = DunningService::new(self.stripe.clone(), self.pool.clone(), self.notify.clone());
        dunning.schedule_retry(&customer_id, account_id).await?;

        let attempt_count = invoice.attempt_count.unwrap_or(0) as i32;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::InvoiceFailed)
                    .data(serde_json::json!({
                        "amount_due_cents": invoice.amount_due,
                        "attempt_count": attempt_count,
                    }))
                    .stripe_event(&event_id)
                    .stripe_invoice(invoice.id.as_str())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log invoice payment failed event");
        }

        let _ = self
            .notify
            .payment_failed(account_id, invoice.amount_due.unwrap_or(0), attempt_count)
            .await;

        tracing::warn!(
            account_id = %account_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_due,
            attempt_count = attempt_count,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// `checkout.session.completed` - same transition as checkout
    /// verification, so whichever arrives first wins and the other is a
    /// no-op.
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::Internal(
                    "Expected CheckoutSession payload".to_string(),
                ))
            }
        };

        let account_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("account_id"))
            .and_then(|id| Uuid::parse_str(id).ok());

        let account_id = match account_id {
            Some(id) => id,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "Checkout session completed without account_id metadata, ignoring"
                );
                return Ok(());
            }
        };

        if let Some(subscription_id) = session.subscription {
            let parsed_sub_id = subscription_id.id().as_str().parse().map_err(|e| {
                BillingError::Internal(format!("Invalid subscription ID: {}", e))
            })?;
            let subscription =
                Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

            let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
            sub_service
                .apply_processor_state(account_id, &subscription)
                .await?;

            tracing::info!(
                account_id = %account_id,
                subscription_id = %subscription.id,
                "Checkout completed, subscription reconciled"
            );
        }

        Ok(())
    }

    /// Prune processed-event ledger rows past the retention window. The
    /// processor does not redeliver indefinitely, so old entries only cost
    /// space.
    pub async fn prune_processed_events(&self, retention_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_webhook_events
            WHERE processed_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::Internal(
                "Expected Subscription payload".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::Internal("Expected Invoice payload".to_string())),
        }
    }

    /// Resolve the owning account from subscription metadata, falling back
    /// to the customer correlation id.
    async fn account_id_for_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Uuid> {
        if let Some(account_id) = subscription
            .metadata
            .get("account_id")
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            return Ok(account_id);
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        customers.account_id_for_customer(&customer_id).await
    }

    async fn account_id_for_invoice(&self, invoice: &Invoice) -> BillingResult<(Uuid, String)> {
        let customer_id = match &invoice.customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(c)) => c.id.to_string(),
            None => {
                return Err(BillingError::Internal(
                    "No customer on invoice".to_string(),
                ))
            }
        };

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let account_id = customers.account_id_for_customer(&customer_id).await?;

        Ok((account_id, customer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn now_ts() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn test_parse_signature_header() {
        let (ts, sig) = parse_signature_header("t=1700000000,v1=abc123,v0=legacy").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(sig, "abc123");
    }

    #[test]
    fn test_parse_signature_header_missing_parts() {
        assert!(parse_signature_header("t=1700000000").is_none());
        assert!(parse_signature_header("v1=abc123").is_none());
        assert!(parse_signature_header("garbage").is_none());
    }

    #[test]
    fn test_signature_round_trip() {
        let payload = r#"{"type":"invoice.paid"}"#;
        let ts = now_ts();
        let sig = compute_signature(SECRET, ts, payload).unwrap();

        // Same inputs produce the same signature
        assert_eq!(sig, compute_signature(SECRET, ts, payload).unwrap());
        // Different payload produces a different signature
        assert_ne!(
            sig,
            compute_signature(SECRET, ts, r#"{"type":"invoice.payment_failed"}"#).unwrap()
        );
        // Different secret produces a different signature
        assert_ne!(sig, compute_signature("whsec_other", ts, payload).unwrap());
    }

    #[test]
    fn test_signature_depends_on_timestamp() {
        let payload = r#"{"type":"invoice.paid"}"#;
        let sig_a = compute_signature(SECRET, 1_700_000_000, payload).unwrap();
        let sig_b = compute_signature(SECRET, 1_700_000_001, payload).unwrap();
        assert_ne!(sig_a, sig_b);
    }
}
