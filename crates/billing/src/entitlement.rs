//! Entitlement resolution
//!
//! Answers "can this account do X right now?" from already-reconciled local
//! state. No processor calls happen here - feature gating on the request
//! path must never depend on third-party API latency or availability.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use gigmatch_shared::{FeatureSet, SubscriptionTier, UsageCounter, UNLIMITED};

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionRecord;

/// Result of a feature access check
#[derive(Debug, Clone, Serialize)]
pub struct AccessCheck {
    pub can_access: bool,
    pub tier: SubscriptionTier,
}

/// Result of a usage limit check
#[derive(Debug, Clone, Serialize)]
pub struct UsageCheck {
    pub can_access: bool,
    pub tier: SubscriptionTier,
    /// Limit for the counter (-1 = unlimited)
    pub limit: i32,
    pub used: i32,
    /// Remaining uses (-1 = unlimited)
    pub remaining: i32,
}

/// Remaining uses given a limit and current usage (-1 = unlimited)
pub fn remaining(limit: i32, used: i32) -> i32 {
    if limit == UNLIMITED {
        UNLIMITED
    } else {
        (limit - used).max(0)
    }
}

/// The feature set an account's record currently confers. Falls back to the
/// free-tier set when the record is absent or no longer entitled.
pub fn effective_features(record: Option<&SubscriptionRecord>) -> (SubscriptionTier, FeatureSet) {
    match record {
        Some(r) if r.status.is_entitled() => (r.tier, r.features.clone()),
        _ => (SubscriptionTier::Free, FeatureSet::for_tier(SubscriptionTier::Free)),
    }
}

/// Entitlement service: pure reads over the subscription record store
pub struct EntitlementService {
    pool: PgPool,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_record(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Check a boolean feature flag for an account
    pub async fn check_access(&self, account_id: Uuid, feature: &str) -> BillingResult<AccessCheck> {
        let record = self.load_record(account_id).await?;
        let (tier, features) = effective_features(record.as_ref());

        Ok(AccessCheck {
            can_access: features.has_feature(feature),
            tier,
        })
    }

    /// Check a usage counter against the account's tier limit
    pub async fn check_usage_limit(
        &self,
        account_id: Uuid,
        counter: UsageCounter,
    ) -> BillingResult<UsageCheck> {
        let record = self.load_record(account_id).await?;
        let (tier, features) = effective_features(record.as_ref());
        let limit = features.limit_for(counter);

        let used = record
            .as_ref()
            .map(|r| match counter {
                UsageCounter::Boosts => r.boosts_used_this_month,
                UsageCounter::GigApplications => r.gig_applications_this_month,
            })
            .unwrap_or(0);

        let remaining = remaining(limit, used);

        Ok(UsageCheck {
            can_access: limit == UNLIMITED || remaining > 0,
            tier,
            limit,
            used,
            remaining,
        })
    }

    /// Consume one use of a counter, guarded by the tier limit.
    ///
    /// The increment is a single conditional UPDATE so that concurrent uses
    /// cannot overshoot the limit. Accounts without a subscription record
    /// get a free-tier usage row on first use (the same terminal shape a
    /// downgrade produces).
    pub async fn record_usage(
        &self,
        account_id: Uuid,
        counter: UsageCounter,
    ) -> BillingResult<UsageCheck> {
        let check = self.check_usage_limit(account_id, counter).await?;

        if !check.can_access {
            return Err(BillingError::UsageLimitExceeded {
                feature: counter.to_string(),
                limit: check.limit,
            });
        }

        self.ensure_usage_row(account_id).await?;

        let column = counter.column();
        // Column name comes from a fixed enum, never user input
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET {column} = {column} + 1, updated_at = NOW()
            WHERE account_id = $1 AND ({column} < $2 OR $2 = -1)
            "#,
        );

        let updated = sqlx::query(&sql)
            .bind(account_id)
            .bind(check.limit)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            // Lost the race to the last remaining use
            return Err(BillingError::UsageLimitExceeded {
                feature: counter.to_string(),
                limit: check.limit,
            });
        }

        self.check_usage_limit(account_id, counter).await
    }

    /// Make sure a subscriptions row exists to carry usage counters for
    /// accounts that never purchased anything.
    async fn ensure_usage_row(&self, account_id: Uuid) -> BillingResult<()> {
        let features = serde_json::to_value(FeatureSet::for_tier(SubscriptionTier::Free))
            .unwrap_or_else(|_| serde_json::json!({}));

        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, account_id, tier, status, features, created_at, updated_at)
            VALUES ($1, $2, 'free', 'canceled', $3, NOW(), NOW())
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(&features)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gigmatch_shared::SubscriptionStatus;
    use time::OffsetDateTime;

    fn record(tier: SubscriptionTier, status: SubscriptionStatus, used: i32) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            tier,
            status,
            stripe_subscription_id: Some("sub_test".to_string()),
            stripe_customer_id: Some("cus_test".to_string()),
            is_yearly_billing: false,
            current_period_start: Some(OffsetDateTime::now_utc()),
            current_period_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            features: FeatureSet::for_tier(tier),
            boosts_used_this_month: 0,
            gig_applications_this_month: used,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_remaining_math() {
        assert_eq!(remaining(5, 5), 0);
        assert_eq!(remaining(5, 3), 2);
        assert_eq!(remaining(5, 9), 0);
        assert_eq!(remaining(UNLIMITED, 1000), UNLIMITED);
    }

    #[test]
    fn test_no_record_falls_back_to_free() {
        let (tier, features) = effective_features(None);
        assert_eq!(tier, SubscriptionTier::Free);
        assert_eq!(features, FeatureSet::for_tier(SubscriptionTier::Free));
    }

    #[test]
    fn test_inactive_record_falls_back_to_free() {
        let canceled = record(SubscriptionTier::Premium, SubscriptionStatus::Canceled, 0);
        let (tier, features) = effective_features(Some(&canceled));
        assert_eq!(tier, SubscriptionTier::Free);
        assert!(!features.priority_matching);

        let paused = record(SubscriptionTier::Pro, SubscriptionStatus::Paused, 0);
        let (tier, _) = effective_features(Some(&paused));
        assert_eq!(tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_active_record_confers_its_tier() {
        let active = record(SubscriptionTier::Premium, SubscriptionStatus::Active, 0);
        let (tier, features) = effective_features(Some(&active));
        assert_eq!(tier, SubscriptionTier::Premium);
        assert!(features.priority_matching);

        // past_due keeps entitlements during the dunning window
        let past_due = record(SubscriptionTier::Pro, SubscriptionStatus::PastDue, 0);
        let (tier, _) = effective_features(Some(&past_due));
        assert_eq!(tier, SubscriptionTier::Pro);
    }

    #[test]
    fn test_free_limit_exhaustion_scenario() {
        // Free tier, 5 of 5 gig applications used
        let free = record(SubscriptionTier::Free, SubscriptionStatus::Canceled, 5);
        let (_, features) = effective_features(Some(&free));
        let limit = features.limit_for(UsageCounter::GigApplications);
        assert_eq!(limit, 5);
        assert_eq!(remaining(limit, free.gig_applications_this_month), 0);

        // After an upgrade to pro the counter resets and the limit is 20
        let pro = record(SubscriptionTier::Pro, SubscriptionStatus::Active, 0);
        let (_, features) = effective_features(Some(&pro));
        let limit = features.limit_for(UsageCounter::GigApplications);
        assert_eq!(limit, 20);
        assert_eq!(remaining(limit, pro.gig_applications_this_month), 20);
    }
}
