//! Payment failure retry scheduling
//!
//! On a payment failure the account enters a bounded dunning cycle: checks
//! at 1h, 6h, and 24h after the failure, keyed by processor customer id.
//! A payment observed anywhere in the system resets the cycle; exhausting
//! all attempts forces an immediate cancellation. Every cycle terminates in
//! a definitive state, never an indefinite pending one.
//!
//! State lives in Postgres (not process memory) so it survives restarts and
//! scales past one instance. The worker drains due rows with
//! FOR UPDATE SKIP LOCKED, so concurrent drains cannot double-process.

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notify::NotificationClient;
use crate::subscriptions::SubscriptionService;

/// Maximum dunning checks before forced cancellation
pub const MAX_RETRY_ATTEMPTS: i32 = 3;

/// Delay before the given check attempt (0-based)
pub fn backoff_delay(attempt: i32) -> Duration {
    match attempt {
        0 => Duration::hours(1),
        1 => Duration::hours(6),
        _ => Duration::hours(24),
    }
}

/// Dunning service: schedules and runs payment-failure re-checks
pub struct DunningService {
    stripe: StripeClient,
    pool: PgPool,
    notify: NotificationClient,
}

impl DunningService {
    pub fn new(stripe: StripeClient, pool: PgPool, notify: NotificationClient) -> Self {
        Self {
            stripe,
            pool,
            notify,
        }
    }

    /// Schedule the dunning cycle for a delinquent customer.
    ///
    /// Idempotent per cycle: repeated failure events for a customer already
    /// in dunning keep the existing attempt counter and schedule.
    pub async fn schedule_retry(
        &self,
        stripe_customer_id: &str,
        account_id: Uuid,
    ) -> BillingResult<()> {
        let next_check_at = OffsetDateTime::now_utc() + backoff_delay(0);

        let inserted = sqlx::query(
            r#"
            INSERT INTO payment_retry_state
                (stripe_customer_id, account_id, attempt, next_check_at, status)
            VALUES ($1, $2, 0, $3, 'scheduled')
            ON CONFLICT (stripe_customer_id) DO NOTHING
            "#,
        )
        .bind(stripe_customer_id)
        .bind(account_id)
        .bind(next_check_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            let event_logger = BillingEventLogger::new(self.pool.clone());
            if let Err(e) = event_logger
                .log_event(
                    BillingEventBuilder::new(account_id, BillingEventType::PaymentRetryScheduled)
                        .data(serde_json::json!({
                            "next_check_at": next_check_at.unix_timestamp(),
                        }))
                        .stripe_customer(stripe_customer_id)
                        .actor_type(ActorType::System),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log retry scheduled event");
            }

            tracing::info!(
                account_id = %account_id,
                customer_id = %stripe_customer_id,
                next_check_at = %next_check_at,
                "Scheduled payment retry check"
            );
        }

        Ok(())
    }

    /// Reset the dunning cycle for a customer. Called on any successful
    /// payment observed for that customer, regardless of which component
    /// observed it.
    pub async fn reset(&self, stripe_customer_id: &str) -> BillingResult<()> {
        let deleted = sqlx::query("DELETE FROM payment_retry_state WHERE stripe_customer_id = $1")
            .bind(stripe_customer_id)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() > 0 {
            tracing::info!(
                customer_id = %stripe_customer_id,
                "Payment recovered, dunning cycle reset"
            );
        }

        Ok(())
    }

    /// Process all due dunning checks. Run by the worker every minute.
    ///
    /// Each check either observes the subscription back in good standing
    /// (resolve), reschedules with the next backoff delay, or - after the
    /// final attempt - forces an immediate cancellation and downgrade.
    pub async fn run_due_checks(&self) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let due: Vec<(String, Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT stripe_customer_id, account_id, attempt
            FROM payment_retry_state
            WHERE status = 'scheduled' AND next_check_at <= NOW()
            ORDER BY next_check_at ASC
            LIMIT 20
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut processed = 0u64;
        let subscriptions = SubscriptionService::new(self.stripe.clone(), self.pool.clone());

        for (customer_id, account_id, attempt) in due {
            let record = subscriptions.get_subscription(account_id).await?;

            let recovered = record
                .as_ref()
                .map(|r| {
                    matches!(
                        r.status,
                        gigmatch_shared::SubscriptionStatus::Active
                            | gigmatch_shared::SubscriptionStatus::Trialing
                    )
                })
                .unwrap_or(false);

            if recovered {
                sqlx::query("DELETE FROM payment_retry_state WHERE stripe_customer_id = $1")
                    .bind(&customer_id)
                    .execute(&mut *tx)
                    .await?;

                tracing::info!(
                    account_id = %account_id,
                    customer_id = %customer_id,
                    "Subscription recovered, dunning check resolved"
                );
            } else if attempt + 1 >= MAX_RETRY_ATTEMPTS {
                // Final attempt exhausted: forced cancellation
                sqlx::query("DELETE FROM payment_retry_state WHERE stripe_customer_id = $1")
                    .bind(&customer_id)
                    .execute(&mut *tx)
                    .await?;

                self.force_cancel(account_id, &customer_id).await;
            } else {
                let next_check_at = OffsetDateTime::now_utc() + backoff_delay(attempt + 1);
                sqlx::query(
                    r#"
                    UPDATE payment_retry_state
                    SET attempt = attempt + 1, next_check_at = $2, updated_at = NOW()
                    WHERE stripe_customer_id = $1
                    "#,
                )
                .bind(&customer_id)
                .bind(next_check_at)
                .execute(&mut *tx)
                .await?;

                tracing::warn!(
                    account_id = %account_id,
                    customer_id = %customer_id,
                    attempt = attempt + 1,
                    next_check_at = %next_check_at,
                    "Payment still failing, rescheduled dunning check"
                );
            }

            processed += 1;
        }

        tx.commit().await?;

        Ok(processed)
    }

    /// Forced cancellation after retry exhaustion. Failures surface through
    /// logging only - there is no caller to report back to.
    async fn force_cancel(&self, account_id: Uuid, customer_id: &str) {
        match SubscriptionService::new(self.stripe.clone(), self.pool.clone())
            .downgrade_to_free(account_id, "payment retries exhausted")
            .await
        {
            Ok(_) => {
                let event_logger = BillingEventLogger::new(self.pool.clone());
                if let Err(e) = event_logger
                    .log_event(
                        BillingEventBuilder::new(
                            account_id,
                            BillingEventType::PaymentRetryExhausted,
                        )
                        .data(serde_json::json!({ "max_attempts": MAX_RETRY_ATTEMPTS }))
                        .stripe_customer(customer_id)
                        .actor_type(ActorType::System),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log retry exhausted event");
                }

                let _ = self
                    .notify
                    .subscription_downgraded(account_id, "payment_failed")
                    .await;

                tracing::warn!(
                    account_id = %account_id,
                    customer_id = %customer_id,
                    "Payment retries exhausted, subscription cancelled"
                );
            }
            Err(e) => {
                tracing::error!(
                    account_id = %account_id,
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to force-cancel after retry exhaustion"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::hours(1));
        assert_eq!(backoff_delay(1), Duration::hours(6));
        assert_eq!(backoff_delay(2), Duration::hours(24));
        // Out-of-range attempts cap at the final delay
        assert_eq!(backoff_delay(7), Duration::hours(24));
    }

    #[test]
    fn test_max_attempts_is_bounded() {
        assert_eq!(MAX_RETRY_ATTEMPTS, 3);
    }
}
