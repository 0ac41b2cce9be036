//! Stripe client configuration

use stripe::Client;

use gigmatch_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// Deployment environment; controls the webhook signature policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription tier
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
    /// Deployment environment
    pub environment: Environment,
}

/// Stripe price IDs for subscription tiers
/// Tier hierarchy: Free (no price) → Pro → Premium
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub pro_monthly: String,
    pub premium_monthly: String,

    // Yearly prices (discounted)
    pub pro_yearly: Option<String>,
    pub premium_yearly: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let environment = Environment::from_env();
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();

        // An empty webhook secret disables signature verification, which is
        // only acceptable for local testing.
        if environment.is_production() && webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET must be set in production".to_string(),
            ));
        }

        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret,
            price_ids: PriceIds {
                pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PRO_MONTHLY not set".to_string())
                })?,
                premium_monthly: std::env::var("STRIPE_PRICE_PREMIUM_MONTHLY").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PREMIUM_MONTHLY not set".to_string())
                })?,
                pro_yearly: std::env::var("STRIPE_PRICE_PRO_YEARLY").ok(),
                premium_yearly: std::env::var("STRIPE_PRICE_PREMIUM_YEARLY").ok(),
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            environment,
        })
    }

    /// Get the price ID for a tier and billing interval
    pub fn price_id_for_tier(&self, tier: SubscriptionTier, yearly: bool) -> Option<&str> {
        match (tier, yearly) {
            (SubscriptionTier::Pro, false) => Some(&self.price_ids.pro_monthly),
            (SubscriptionTier::Premium, false) => Some(&self.price_ids.premium_monthly),
            (SubscriptionTier::Pro, true) => self.price_ids.pro_yearly.as_deref(),
            (SubscriptionTier::Premium, true) => self.price_ids.premium_yearly.as_deref(),
            (SubscriptionTier::Free, _) => None,
        }
    }

    /// Get the tier for a price ID (handles both monthly and yearly prices)
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        if price_id == self.price_ids.pro_monthly {
            Some(SubscriptionTier::Pro)
        } else if price_id == self.price_ids.premium_monthly {
            Some(SubscriptionTier::Premium)
        } else if self.price_ids.pro_yearly.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Pro)
        } else if self.price_ids.premium_yearly.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Premium)
        } else {
            None
        }
    }

    /// Check if a price ID is for yearly billing
    pub fn is_yearly_price(&self, price_id: &str) -> bool {
        self.price_ids.pro_yearly.as_deref() == Some(price_id)
            || self.price_ids.premium_yearly.as_deref() == Some(price_id)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_xxx".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                pro_monthly: "price_pro_m".to_string(),
                premium_monthly: "price_premium_m".to_string(),
                pro_yearly: Some("price_pro_y".to_string()),
                premium_yearly: None,
            },
            app_base_url: "http://localhost:3000".to_string(),
            environment: Environment::Development,
        }
    }

    #[test]
    fn test_price_id_resolution() {
        let config = test_config();
        assert_eq!(
            config.price_id_for_tier(SubscriptionTier::Pro, false),
            Some("price_pro_m")
        );
        assert_eq!(
            config.price_id_for_tier(SubscriptionTier::Pro, true),
            Some("price_pro_y")
        );
        // Premium yearly not configured
        assert_eq!(config.price_id_for_tier(SubscriptionTier::Premium, true), None);
        // Free has no price
        assert_eq!(config.price_id_for_tier(SubscriptionTier::Free, false), None);
    }

    #[test]
    fn test_tier_for_price_id_round_trip() {
        let config = test_config();
        assert_eq!(
            config.tier_for_price_id("price_pro_m"),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            config.tier_for_price_id("price_pro_y"),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            config.tier_for_price_id("price_premium_m"),
            Some(SubscriptionTier::Premium)
        );
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
    }

    #[test]
    fn test_is_yearly_price() {
        let config = test_config();
        assert!(config.is_yearly_price("price_pro_y"));
        assert!(!config.is_yearly_price("price_pro_m"));
    }
}
