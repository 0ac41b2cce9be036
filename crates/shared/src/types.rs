//! Core subscription types shared across the GigMatch platform

use serde::{Deserialize, Serialize};

/// Sentinel limit value meaning "unlimited"
pub const UNLIMITED: i32 = -1;

/// Subscription tier for an account
/// Tier hierarchy: Free (no price) → Pro → Premium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Premium,
}

impl SubscriptionTier {
    /// Numeric rank for tier comparisons (upgrades go up, downgrades go down)
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Pro => 1,
            Self::Premium => 2,
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != Self::Free
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

/// Subscription record status - the state machine variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    /// Whether this status still confers the paid tier's entitlements.
    /// `past_due` keeps entitlements during the dunning window; the retry
    /// scheduler drives it to a terminal state.
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Unpaid => write!(f, "unpaid"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Named per-period usage counters tracked on the subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCounter {
    Boosts,
    GigApplications,
}

impl UsageCounter {
    /// Column name backing this counter on the subscriptions table
    pub fn column(&self) -> &'static str {
        match self {
            Self::Boosts => "boosts_used_this_month",
            Self::GigApplications => "gig_applications_this_month",
        }
    }
}

impl std::fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boosts => write!(f, "boosts"),
            Self::GigApplications => write!(f, "gig_applications"),
        }
    }
}

impl std::str::FromStr for UsageCounter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boosts" => Ok(Self::Boosts),
            "gig_applications" => Ok(Self::GigApplications),
            _ => Err(format!("Unknown usage counter: {}", s)),
        }
    }
}

/// Feature flags and usage limits for a tier.
///
/// This is the denormalized entitlement snapshot stored on each subscription
/// record so that feature gating never depends on processor availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub profile_boost: bool,
    pub priority_matching: bool,
    pub read_receipts: bool,
    pub advanced_filters: bool,
    pub undo_swipe: bool,
    /// Profile boosts per month (-1 = unlimited)
    pub monthly_boosts: i32,
    /// Gig applications per month (-1 = unlimited)
    pub monthly_gig_applications: i32,
    /// Swipe likes per day (-1 = unlimited)
    pub daily_likes: i32,
}

impl FeatureSet {
    /// Get the feature set for a tier
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Free => Self {
                profile_boost: false,
                priority_matching: false,
                read_receipts: false,
                advanced_filters: false,
                undo_swipe: false,
                monthly_boosts: 0,
                monthly_gig_applications: 5,
                daily_likes: 20,
            },
            SubscriptionTier::Pro => Self {
                profile_boost: true,
                priority_matching: false,
                read_receipts: true,
                advanced_filters: true,
                undo_swipe: true,
                monthly_boosts: 5,
                monthly_gig_applications: 20,
                daily_likes: 100,
            },
            SubscriptionTier::Premium => Self {
                profile_boost: true,
                priority_matching: true,
                read_receipts: true,
                advanced_filters: true,
                undo_swipe: true,
                monthly_boosts: UNLIMITED,
                monthly_gig_applications: UNLIMITED,
                daily_likes: UNLIMITED,
            },
        }
    }

    /// Check a boolean feature flag by name
    pub fn has_feature(&self, feature: &str) -> bool {
        match feature {
            "profile_boost" => self.profile_boost,
            "priority_matching" => self.priority_matching,
            "read_receipts" => self.read_receipts,
            "advanced_filters" => self.advanced_filters,
            "undo_swipe" => self.undo_swipe,
            _ => false,
        }
    }

    /// Limit for a named usage counter
    pub fn limit_for(&self, counter: UsageCounter) -> i32 {
        match counter {
            UsageCounter::Boosts => self.monthly_boosts,
            UsageCounter::GigApplications => self.monthly_gig_applications,
        }
    }

    /// Display list of feature names enabled on this set, in catalog order
    pub fn display_features(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.profile_boost {
            out.push("Profile boosts".to_string());
        }
        if self.priority_matching {
            out.push("Priority matching".to_string());
        }
        if self.read_receipts {
            out.push("Read receipts".to_string());
        }
        if self.advanced_filters {
            out.push("Advanced filters".to_string());
        }
        if self.undo_swipe {
            out.push("Undo swipe".to_string());
        }
        out.push(match self.monthly_gig_applications {
            UNLIMITED => "Unlimited gig applications".to_string(),
            n => format!("{} gig applications per month", n),
        });
        out.push(match self.daily_likes {
            UNLIMITED => "Unlimited daily likes".to_string(),
            n => format!("{} likes per day", n),
        });
        out
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::for_tier(SubscriptionTier::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display_round_trip() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Pro,
            SubscriptionTier::Premium,
        ] {
            let parsed: SubscriptionTier = tier.to_string().parse().unwrap();
            assert_eq!(parsed, tier);
        }
    }

    #[test]
    fn test_tier_rank_ordering() {
        assert!(SubscriptionTier::Free.rank() < SubscriptionTier::Pro.rank());
        assert!(SubscriptionTier::Pro.rank() < SubscriptionTier::Premium.rank());
    }

    #[test]
    fn test_status_entitled() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Canceled.is_entitled());
        assert!(!SubscriptionStatus::Unpaid.is_entitled());
        assert!(!SubscriptionStatus::Paused.is_entitled());
    }

    #[test]
    fn test_free_tier_limits() {
        let features = FeatureSet::for_tier(SubscriptionTier::Free);
        assert!(!features.profile_boost);
        assert_eq!(features.limit_for(UsageCounter::GigApplications), 5);
        assert_eq!(features.limit_for(UsageCounter::Boosts), 0);
    }

    #[test]
    fn test_premium_is_unlimited() {
        let features = FeatureSet::for_tier(SubscriptionTier::Premium);
        assert_eq!(features.limit_for(UsageCounter::Boosts), UNLIMITED);
        assert_eq!(features.limit_for(UsageCounter::GigApplications), UNLIMITED);
    }

    #[test]
    fn test_unknown_feature_is_denied() {
        let features = FeatureSet::for_tier(SubscriptionTier::Premium);
        assert!(!features.has_feature("teleportation"));
    }
}
