//! Plan catalog
//!
//! Static definitions of the purchasable tiers, their prices, and the
//! entitlement sets they grant. Loaded once per process; never mutated at
//! runtime.

use serde::Serialize;

use gigmatch_shared::{FeatureSet, SubscriptionTier};

use crate::client::StripeConfig;

/// A purchasable plan
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub tier: SubscriptionTier,
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub stripe_monthly_price_id: Option<String>,
    pub stripe_yearly_price_id: Option<String>,
    /// Ordered feature list for display
    pub features: Vec<String>,
    pub is_available: bool,
}

/// The plan catalog, resolved from configuration at startup
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn from_config(config: &StripeConfig) -> Self {
        let plans = vec![
            Plan {
                id: "free".to_string(),
                tier: SubscriptionTier::Free,
                monthly_price_cents: 0,
                yearly_price_cents: 0,
                stripe_monthly_price_id: None,
                stripe_yearly_price_id: None,
                features: FeatureSet::for_tier(SubscriptionTier::Free).display_features(),
                is_available: true,
            },
            Plan {
                id: "pro".to_string(),
                tier: SubscriptionTier::Pro,
                monthly_price_cents: 1_999,
                yearly_price_cents: 19_990,
                stripe_monthly_price_id: Some(config.price_ids.pro_monthly.clone()),
                stripe_yearly_price_id: config.price_ids.pro_yearly.clone(),
                features: FeatureSet::for_tier(SubscriptionTier::Pro).display_features(),
                is_available: true,
            },
            Plan {
                id: "premium".to_string(),
                tier: SubscriptionTier::Premium,
                monthly_price_cents: 3_999,
                yearly_price_cents: 39_990,
                stripe_monthly_price_id: Some(config.price_ids.premium_monthly.clone()),
                stripe_yearly_price_id: config.price_ids.premium_yearly.clone(),
                features: FeatureSet::for_tier(SubscriptionTier::Premium).display_features(),
                is_available: true,
            },
        ];

        Self { plans }
    }

    /// All available plans in display order
    pub fn plans(&self) -> Vec<&Plan> {
        self.plans.iter().filter(|p| p.is_available).collect()
    }

    pub fn plan_for_tier(&self, tier: SubscriptionTier) -> Option<&Plan> {
        self.plans.iter().find(|p| p.tier == tier)
    }

    /// Resolve the tier a Stripe price ID belongs to
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        self.plans
            .iter()
            .find(|p| {
                p.stripe_monthly_price_id.as_deref() == Some(price_id)
                    || p.stripe_yearly_price_id.as_deref() == Some(price_id)
            })
            .map(|p| p.tier)
    }

    pub fn is_yearly_price(&self, price_id: &str) -> bool {
        self.plans
            .iter()
            .any(|p| p.stripe_yearly_price_id.as_deref() == Some(price_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Environment, PriceIds};

    fn test_catalog() -> PlanCatalog {
        PlanCatalog::from_config(&StripeConfig {
            secret_key: "sk_test_xxx".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                pro_monthly: "price_pro_m".to_string(),
                premium_monthly: "price_premium_m".to_string(),
                pro_yearly: Some("price_pro_y".to_string()),
                premium_yearly: Some("price_premium_y".to_string()),
            },
            app_base_url: "http://localhost:3000".to_string(),
            environment: Environment::Development,
        })
    }

    #[test]
    fn test_catalog_has_all_tiers() {
        let catalog = test_catalog();
        assert_eq!(catalog.plans().len(), 3);
        assert!(catalog.plan_for_tier(SubscriptionTier::Free).is_some());
        assert!(catalog.plan_for_tier(SubscriptionTier::Premium).is_some());
    }

    #[test]
    fn test_free_plan_has_no_price_ids() {
        let catalog = test_catalog();
        let free = catalog.plan_for_tier(SubscriptionTier::Free).unwrap();
        assert!(free.stripe_monthly_price_id.is_none());
        assert_eq!(free.monthly_price_cents, 0);
    }

    #[test]
    fn test_tier_for_price_id_resolves_both_intervals() {
        let catalog = test_catalog();
        assert_eq!(
            catalog.tier_for_price_id("price_pro_m"),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            catalog.tier_for_price_id("price_premium_y"),
            Some(SubscriptionTier::Premium)
        );
        assert_eq!(catalog.tier_for_price_id("price_nope"), None);
        assert!(catalog.is_yearly_price("price_premium_y"));
        assert!(!catalog.is_yearly_price("price_premium_m"));
    }
}
