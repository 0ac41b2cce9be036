//! Subscription record store and state machine
//!
//! One record per account, mutated exclusively through atomic upserts so
//! that concurrent webhooks and user-initiated calls cannot lose updates.
//! Every transition also writes the denormalized authorization fields on the
//! account row in the same logical operation.

use gigmatch_shared::{FeatureSet, SubscriptionStatus, SubscriptionTier};
use sqlx::PgPool;
use stripe::{
    CancelSubscription, CreateSubscription, CreateSubscriptionItems, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Map a processor-reported status onto the local state machine.
///
/// `incomplete` (checkout never finished paying) reads as unpaid;
/// `incomplete_expired` is terminal and reads as canceled.
pub fn map_stripe_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Incomplete => SubscriptionStatus::Unpaid,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::Canceled,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

/// Whether the account's denormalized `has_active_subscription` flag should
/// be set for a record in this state
pub fn has_active_subscription(tier: SubscriptionTier, status: SubscriptionStatus) -> bool {
    tier.is_paid() && status.is_entitled()
}

/// The per-account subscription record
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub is_yearly_billing: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    /// Denormalized entitlement snapshot for the current tier
    pub features: FeatureSet,
    pub boosts_used_this_month: i32,
    pub gig_applications_this_month: i32,
    pub updated_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let tier: String = row.try_get("tier")?;
        let status: String = row.try_get("status")?;
        let features: serde_json::Value = row.try_get("features")?;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            tier: tier.parse().unwrap_or(SubscriptionTier::Free),
            status: status.parse().unwrap_or(SubscriptionStatus::Canceled),
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            is_yearly_billing: row.try_get("is_yearly_billing")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            canceled_at: row.try_get("canceled_at")?,
            trial_start: row.try_get("trial_start")?,
            trial_end: row.try_get("trial_end")?,
            features: serde_json::from_value(features).unwrap_or_default(),
            boosts_used_this_month: row.try_get("boosts_used_this_month")?,
            gig_applications_this_month: row.try_get("gig_applications_this_month")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Field set for a record upsert; every mutation path funnels through this
struct RecordUpsert {
    account_id: Uuid,
    tier: SubscriptionTier,
    status: SubscriptionStatus,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    is_yearly_billing: bool,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    trial_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
}

/// Subscription service for managing subscription records
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            event_logger,
        }
    }

    /// Get the subscription record for an account, if any
    pub async fn get_subscription(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Apply processor-reported subscription state to the local record.
    ///
    /// This is the single sync point used by checkout verification and every
    /// subscription webhook; transitions are idempotent with respect to the
    /// processor-reported status.
    pub async fn apply_processor_state(
        &self,
        account_id: Uuid,
        subscription: &Subscription,
    ) -> BillingResult<SubscriptionRecord> {
        let status = map_stripe_status(subscription.status);

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        // Terminal statuses always resolve to the free tier; otherwise the
        // tier follows the price on the subscription, falling back to the
        // currently recorded tier when the price is not in our catalog.
        let tier = match status {
            SubscriptionStatus::Canceled | SubscriptionStatus::Unpaid => SubscriptionTier::Free,
            _ => match price_id
                .as_deref()
                .and_then(|p| self.stripe.config().tier_for_price_id(p))
            {
                Some(tier) => tier,
                None => {
                    tracing::warn!(
                        account_id = %account_id,
                        price_id = ?price_id,
                        "Unknown price on processor subscription, keeping recorded tier"
                    );
                    self.get_subscription(account_id)
                        .await?
                        .map(|r| r.tier)
                        .unwrap_or(SubscriptionTier::Free)
                }
            },
        };

        let is_yearly = price_id
            .as_deref()
            .map(|p| self.stripe.config().is_yearly_price(p))
            .unwrap_or(false);

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let to_ts = |t: i64| OffsetDateTime::from_unix_timestamp(t).ok();

        let record = self
            .upsert_record(RecordUpsert {
                account_id,
                tier,
                status,
                stripe_subscription_id: Some(subscription.id.to_string()),
                stripe_customer_id: Some(customer_id),
                is_yearly_billing: is_yearly,
                current_period_start: to_ts(subscription.current_period_start),
                current_period_end: to_ts(subscription.current_period_end),
                cancel_at_period_end: subscription.cancel_at_period_end,
                canceled_at: subscription.canceled_at.and_then(to_ts),
                trial_start: subscription.trial_start.and_then(to_ts),
                trial_end: subscription.trial_end.and_then(to_ts),
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.id,
            tier = %tier,
            status = %status,
            "Applied processor subscription state"
        );

        Ok(record)
    }

    /// Create-or-update into a paid state from a validated store receipt.
    ///
    /// The synthetic subscription id is namespaced by platform so it can
    /// never collide with processor-path ids.
    pub async fn activate_external(
        &self,
        account_id: Uuid,
        tier: SubscriptionTier,
        is_yearly: bool,
        synthetic_subscription_id: &str,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self
            .upsert_record(RecordUpsert {
                account_id,
                tier,
                status: SubscriptionStatus::Active,
                stripe_subscription_id: Some(synthetic_subscription_id.to_string()),
                stripe_customer_id: None,
                is_yearly_billing: is_yearly,
                current_period_start: Some(OffsetDateTime::now_utc()),
                current_period_end: period_end,
                cancel_at_period_end: false,
                canceled_at: None,
                trial_start: None,
                trial_end: None,
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %synthetic_subscription_id,
            tier = %tier,
            "Activated subscription from store receipt"
        );

        Ok(record)
    }

    /// Cancel an account's subscription.
    ///
    /// `immediate = false` sets the soft-cancel flag; the record keeps its
    /// tier and `active` status until the paid period ends. `immediate =
    /// true` cancels at the processor now and resolves to `canceled`/free.
    /// Synchronous: processor failures propagate to the caller.
    pub async fn cancel(
        &self,
        account_id: Uuid,
        immediate: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self
            .get_subscription(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for {}", account_id)))?;

        match record.stripe_subscription_id.as_deref() {
            // Store-managed subscriptions have no processor side to cancel;
            // renewal stops in the store, we only record the transition.
            Some(sub_id) if sub_id.starts_with("iap:") => {
                if immediate {
                    self.downgrade_to_free(account_id, "user cancellation").await
                } else {
                    self.set_cancel_at_period_end(account_id, true).await
                }
            }
            Some(sub_id) => {
                let sub_id = sub_id.parse::<SubscriptionId>().map_err(|e| {
                    BillingError::Internal(format!("Invalid subscription ID: {}", e))
                })?;

                let subscription = if immediate {
                    let params = CancelSubscription {
                        cancellation_details: None,
                        invoice_now: None,
                        prorate: None,
                    };
                    Subscription::cancel(self.stripe.inner(), &sub_id, params).await?
                } else {
                    let params = UpdateSubscription {
                        cancel_at_period_end: Some(true),
                        ..Default::default()
                    };
                    Subscription::update(self.stripe.inner(), &sub_id, params).await?
                };

                let record = self.apply_processor_state(account_id, &subscription).await?;

                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(account_id, BillingEventType::SubscriptionCanceled)
                            .data(serde_json::json!({
                                "immediate": immediate,
                                "period_end": record.current_period_end.map(|t| t.unix_timestamp()),
                            }))
                            .stripe_subscription(sub_id.as_str())
                            .actor_type(ActorType::User),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log cancellation event");
                }

                tracing::info!(
                    account_id = %account_id,
                    immediate = immediate,
                    "Cancelled subscription"
                );

                Ok(record)
            }
            None => Err(BillingError::NotFound(format!(
                "No processor subscription for {}",
                account_id
            ))),
        }
    }

    /// Resume a subscription that was soft-cancelled (still inside the paid
    /// period)
    pub async fn resume(&self, account_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record = self
            .get_subscription(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for {}", account_id)))?;

        if !record.cancel_at_period_end {
            return Err(BillingError::Conflict(
                "Subscription is not scheduled for cancellation".to_string(),
            ));
        }

        match record.stripe_subscription_id.as_deref() {
            Some(sub_id) if sub_id.starts_with("iap:") => {
                self.set_cancel_at_period_end(account_id, false).await
            }
            Some(sub_id) => {
                let sub_id = sub_id.parse::<SubscriptionId>().map_err(|e| {
                    BillingError::Internal(format!("Invalid subscription ID: {}", e))
                })?;

                let params = UpdateSubscription {
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                };
                let subscription =
                    Subscription::update(self.stripe.inner(), &sub_id, params).await?;

                let record = self.apply_processor_state(account_id, &subscription).await?;

                tracing::info!(account_id = %account_id, "Resumed subscription");

                Ok(record)
            }
            None => Err(BillingError::NotFound(format!(
                "No processor subscription for {}",
                account_id
            ))),
        }
    }

    /// Change the plan on an existing processor subscription.
    ///
    /// Proration is delegated to the processor. The local entitlement
    /// snapshot reflects the new tier immediately, without waiting for the
    /// confirming webhook.
    pub async fn change_plan(
        &self,
        account_id: Uuid,
        new_tier: SubscriptionTier,
        yearly: bool,
    ) -> BillingResult<SubscriptionRecord> {
        if new_tier == SubscriptionTier::Free {
            return Err(BillingError::InvalidInput(
                "Downgrade to free is a cancellation; use cancel instead".to_string(),
            ));
        }

        let price_id = self
            .stripe
            .config()
            .price_id_for_tier(new_tier, yearly)
            .ok_or_else(|| BillingError::InvalidTier(new_tier.to_string()))?
            .to_string();

        let record = self
            .get_subscription(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for {}", account_id)))?;

        let sub_id = match record.stripe_subscription_id.as_deref() {
            Some(s) if !s.starts_with("iap:") => s.parse::<SubscriptionId>().map_err(|e| {
                BillingError::Internal(format!("Invalid subscription ID: {}", e))
            })?,
            Some(_) => {
                return Err(BillingError::Conflict(
                    "Subscription is managed by a mobile store".to_string(),
                ))
            }
            None => {
                return Err(BillingError::NotFound(
                    "No processor subscription; use checkout".to_string(),
                ))
            }
        };

        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        let from_tier = record.tier;
        let updated = self.apply_processor_state(account_id, &subscription).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::TierChanged)
                    .data(serde_json::json!({
                        "from_tier": from_tier.to_string(),
                        "to_tier": new_tier.to_string(),
                    }))
                    .stripe_subscription(sub_id.as_str())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log tier change event");
        }

        tracing::info!(
            account_id = %account_id,
            from_tier = %from_tier,
            to_tier = %new_tier,
            "Changed subscription plan"
        );

        Ok(updated)
    }

    /// Start a trial subscription. One trial per account, ever.
    pub async fn start_trial(
        &self,
        account_id: Uuid,
        email: &str,
        name: &str,
        tier: SubscriptionTier,
        trial_days: u32,
    ) -> BillingResult<SubscriptionRecord> {
        let previous: Option<(Option<OffsetDateTime>,)> =
            sqlx::query_as("SELECT trial_start FROM subscriptions WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        if matches!(previous, Some((Some(_),))) {
            return Err(BillingError::Conflict("Trial already used".to_string()));
        }

        let price_id = self
            .stripe
            .config()
            .price_id_for_tier(tier, false)
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?
            .to_string();

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer = customers
            .get_or_create_customer(account_id, email, name)
            .await?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());

        let mut params = CreateSubscription::new(customer.id.clone());
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.trial_period_days = Some(trial_days);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        let record = self.apply_processor_state(account_id, &subscription).await?;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::TrialStarted)
                    .data(serde_json::json!({
                        "tier": tier.to_string(),
                        "trial_days": trial_days,
                    }))
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log trial started event");
        }

        tracing::info!(
            account_id = %account_id,
            tier = %tier,
            trial_days = trial_days,
            "Started trial subscription"
        );

        Ok(record)
    }

    /// Forced terminal transition to `canceled`/free. Used for
    /// `subscription.deleted` webhooks, retry exhaustion, and the period-end
    /// sweep.
    pub async fn downgrade_to_free(
        &self,
        account_id: Uuid,
        reason: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let features = serde_json::to_value(FeatureSet::for_tier(SubscriptionTier::Free))
            .unwrap_or_else(|_| serde_json::json!({}));

        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET tier = 'free',
                status = 'canceled',
                cancel_at_period_end = FALSE,
                canceled_at = COALESCE(canceled_at, NOW()),
                features = $2,
                updated_at = NOW()
            WHERE account_id = $1
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(&features)
        .fetch_optional(&self.pool)
        .await?;

        let record = record
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for {}", account_id)))?;

        self.sync_account_fields(account_id, SubscriptionTier::Free, false)
            .await;

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(account_id, BillingEventType::SubscriptionCanceled)
                    .data(serde_json::json!({ "reason": reason }))
                    .actor_type(ActorType::System),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log downgrade event");
        }

        tracing::info!(
            account_id = %account_id,
            reason = %reason,
            "Downgraded account to free tier"
        );

        Ok(record)
    }

    /// Local `past_due` transition, driven by `invoice.payment_failed`.
    /// The tier is retained during the dunning window.
    pub async fn mark_past_due(&self, account_id: Uuid) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE account_id = $1 AND status IN ('active', 'trialing')
            "#,
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            if let Some(record) = self.get_subscription(account_id).await? {
                self.sync_account_fields(
                    account_id,
                    record.tier,
                    has_active_subscription(record.tier, SubscriptionStatus::PastDue),
                )
                .await;
            }
            tracing::warn!(account_id = %account_id, "Subscription is past due");
        }

        Ok(())
    }

    /// Drive records whose soft-cancel period has lapsed to `canceled`/free.
    /// Safety net for a missed `subscription.deleted` event; returns the
    /// number of records transitioned.
    pub async fn sweep_expired_period_end_cancellations(&self) -> BillingResult<u64> {
        let expired: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT account_id FROM subscriptions
            WHERE cancel_at_period_end = TRUE
              AND current_period_end IS NOT NULL
              AND current_period_end < NOW()
              AND status IN ('active', 'trialing', 'past_due')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut swept = 0u64;
        for (account_id,) in expired {
            match self
                .downgrade_to_free(account_id, "cancellation period ended")
                .await
            {
                Ok(_) => swept += 1,
                Err(e) => {
                    tracing::error!(
                        account_id = %account_id,
                        error = %e,
                        "Failed to sweep expired cancellation"
                    );
                }
            }
        }

        Ok(swept)
    }

    /// Flip the soft-cancel flag locally (store-managed subscriptions)
    async fn set_cancel_at_period_end(
        &self,
        account_id: Uuid,
        flag: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = $2, updated_at = NOW()
            WHERE account_id = $1
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(flag)
        .fetch_optional(&self.pool)
        .await?;

        record
            .ok_or_else(|| BillingError::NotFound(format!("No subscription for {}", account_id)))
    }

    /// Atomic create-or-update of the subscription record.
    ///
    /// Usage counters reset when the tier changes or a new billing period
    /// starts; otherwise they carry through untouched.
    async fn upsert_record(&self, p: RecordUpsert) -> BillingResult<SubscriptionRecord> {
        let features = serde_json::to_value(FeatureSet::for_tier(p.tier))
            .unwrap_or_else(|_| serde_json::json!({}));

        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                id, account_id, tier, status, stripe_subscription_id, stripe_customer_id,
                is_yearly_billing, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, trial_start, trial_end, features,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW()
            )
            ON CONFLICT (account_id) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                is_yearly_billing = EXCLUDED.is_yearly_billing,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                trial_start = COALESCE(EXCLUDED.trial_start, subscriptions.trial_start),
                trial_end = COALESCE(EXCLUDED.trial_end, subscriptions.trial_end),
                features = EXCLUDED.features,
                boosts_used_this_month = CASE
                    WHEN subscriptions.tier IS DISTINCT FROM EXCLUDED.tier
                      OR subscriptions.current_period_start IS DISTINCT FROM EXCLUDED.current_period_start
                    THEN 0
                    ELSE subscriptions.boosts_used_this_month
                END,
                gig_applications_this_month = CASE
                    WHEN subscriptions.tier IS DISTINCT FROM EXCLUDED.tier
                      OR subscriptions.current_period_start IS DISTINCT FROM EXCLUDED.current_period_start
                    THEN 0
                    ELSE subscriptions.gig_applications_this_month
                END,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(p.account_id)
        .bind(p.tier.to_string())
        .bind(p.status.to_string())
        .bind(&p.stripe_subscription_id)
        .bind(&p.stripe_customer_id)
        .bind(p.is_yearly_billing)
        .bind(p.current_period_start)
        .bind(p.current_period_end)
        .bind(p.cancel_at_period_end)
        .bind(p.canceled_at)
        .bind(p.trial_start)
        .bind(p.trial_end)
        .bind(&features)
        .fetch_one(&self.pool)
        .await?;

        self.sync_account_fields(
            p.account_id,
            p.tier,
            has_active_subscription(p.tier, p.status),
        )
        .await;

        Ok(record)
    }

    /// Write back the denormalized authorization fields on the account row.
    ///
    /// Retried once; a second failure is logged for operator reconciliation
    /// and does not fail the transition, since the subscription record is the
    /// source of truth and the worker sweep self-heals.
    async fn sync_account_fields(&self, account_id: Uuid, tier: SubscriptionTier, active: bool) {
        for attempt in 0..2 {
            let result = sqlx::query(
                r#"
                UPDATE accounts
                SET subscription_tier = $2, has_active_subscription = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(account_id)
            .bind(tier.to_string())
            .bind(active)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(
                        account_id = %account_id,
                        error = %e,
                        "Account field sync failed, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        account_id = %account_id,
                        tier = %tier,
                        active = active,
                        error = %e,
                        "RECONCILIATION NEEDED: denormalized account fields out of sync \
                         with subscription record"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_stripe_status_is_total() {
        let cases = [
            (StripeSubStatus::Active, SubscriptionStatus::Active),
            (StripeSubStatus::Trialing, SubscriptionStatus::Trialing),
            (StripeSubStatus::PastDue, SubscriptionStatus::PastDue),
            (StripeSubStatus::Canceled, SubscriptionStatus::Canceled),
            (StripeSubStatus::Unpaid, SubscriptionStatus::Unpaid),
            (StripeSubStatus::Incomplete, SubscriptionStatus::Unpaid),
            (
                StripeSubStatus::IncompleteExpired,
                SubscriptionStatus::Canceled,
            ),
            (StripeSubStatus::Paused, SubscriptionStatus::Paused),
        ];
        for (input, expected) in cases {
            assert_eq!(map_stripe_status(input), expected);
        }
    }

    #[test]
    fn test_has_active_subscription_requires_paid_tier() {
        // Paid tiers with entitled statuses are active
        assert!(has_active_subscription(
            SubscriptionTier::Pro,
            SubscriptionStatus::Active
        ));
        assert!(has_active_subscription(
            SubscriptionTier::Premium,
            SubscriptionStatus::Trialing
        ));
        // past_due keeps access during the dunning window
        assert!(has_active_subscription(
            SubscriptionTier::Pro,
            SubscriptionStatus::PastDue
        ));
        // Free tier is never "active" regardless of status
        assert!(!has_active_subscription(
            SubscriptionTier::Free,
            SubscriptionStatus::Active
        ));
        // Terminal statuses are never active
        assert!(!has_active_subscription(
            SubscriptionTier::Premium,
            SubscriptionStatus::Canceled
        ));
        assert!(!has_active_subscription(
            SubscriptionTier::Pro,
            SubscriptionStatus::Paused
        ));
    }
}
