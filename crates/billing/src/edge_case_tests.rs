// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Boundary conditions across the subscription state machine, entitlement
//! resolution, dunning schedule, and the dual purchase paths.

#[cfg(test)]
mod state_machine_tests {
    use crate::subscriptions::{has_active_subscription, map_stripe_status};
    use gigmatch_shared::{SubscriptionStatus, SubscriptionTier};
    use stripe::SubscriptionStatus as StripeSubStatus;

    // =========================================================================
    // A soft-cancelled subscription keeps its tier until the period ends
    // =========================================================================
    #[test]
    fn test_soft_cancel_keeps_entitlements() {
        // cancel_at_period_end only flips a flag; processor still reports
        // the subscription as active until the period lapses
        let status = map_stripe_status(StripeSubStatus::Active);
        assert_eq!(status, SubscriptionStatus::Active);
        assert!(has_active_subscription(SubscriptionTier::Pro, status));
    }

    // =========================================================================
    // The deleted event is terminal regardless of how it is reported
    // =========================================================================
    #[test]
    fn test_terminal_statuses_lose_entitlements() {
        for stripe_status in [
            StripeSubStatus::Canceled,
            StripeSubStatus::Unpaid,
            StripeSubStatus::IncompleteExpired,
        ] {
            let status = map_stripe_status(stripe_status);
            assert!(
                !has_active_subscription(SubscriptionTier::Premium, status),
                "{:?} should not keep entitlements",
                stripe_status
            );
        }
    }

    // =========================================================================
    // past_due is a grace state, not a terminal one
    // =========================================================================
    #[test]
    fn test_past_due_is_grace_not_terminal() {
        let status = map_stripe_status(StripeSubStatus::PastDue);
        assert_eq!(status, SubscriptionStatus::PastDue);
        assert!(status.is_entitled());
        assert!(has_active_subscription(SubscriptionTier::Pro, status));
    }

    #[test]
    fn test_paused_suspends_entitlements() {
        let status = map_stripe_status(StripeSubStatus::Paused);
        assert!(!status.is_entitled());
    }
}

#[cfg(test)]
mod entitlement_tests {
    use crate::entitlement::{effective_features, remaining};
    use gigmatch_shared::{FeatureSet, SubscriptionTier, UsageCounter, UNLIMITED};

    // =========================================================================
    // Usage at exactly the limit is denied; one below is allowed
    // =========================================================================
    #[test]
    fn test_limit_boundary() {
        let limit = FeatureSet::for_tier(SubscriptionTier::Free)
            .limit_for(UsageCounter::GigApplications);
        assert_eq!(remaining(limit, limit), 0);
        assert_eq!(remaining(limit, limit - 1), 1);
        // Overshoot (e.g. after a downgrade) clamps to zero, never negative
        assert_eq!(remaining(limit, limit + 10), 0);
    }

    // =========================================================================
    // Unlimited never exhausts
    // =========================================================================
    #[test]
    fn test_unlimited_never_exhausts() {
        assert_eq!(remaining(UNLIMITED, i32::MAX), UNLIMITED);
    }

    // =========================================================================
    // Missing record resolves to exactly the free feature set
    // =========================================================================
    #[test]
    fn test_entitlement_fallback_is_exact_free_set() {
        let (tier, features) = effective_features(None);
        assert_eq!(tier, SubscriptionTier::Free);
        assert_eq!(features, FeatureSet::for_tier(SubscriptionTier::Free));
    }

    // =========================================================================
    // Tier monotonicity: the pro set strictly contains the free set
    // =========================================================================
    #[test]
    fn test_tier_sets_are_monotonic() {
        let free = FeatureSet::for_tier(SubscriptionTier::Free);
        let pro = FeatureSet::for_tier(SubscriptionTier::Pro);
        let premium = FeatureSet::for_tier(SubscriptionTier::Premium);

        assert!(pro.monthly_gig_applications > free.monthly_gig_applications);
        assert!(pro.monthly_boosts > free.monthly_boosts);
        assert_eq!(premium.monthly_gig_applications, UNLIMITED);

        for feature in [
            "profile_boost",
            "read_receipts",
            "advanced_filters",
            "undo_swipe",
        ] {
            assert!(!free.has_feature(feature) || pro.has_feature(feature));
            assert!(pro.has_feature(feature));
            assert!(premium.has_feature(feature));
        }
        assert!(premium.has_feature("priority_matching"));
        assert!(!pro.has_feature("priority_matching"));
    }
}

#[cfg(test)]
mod dunning_tests {
    use crate::dunning::{backoff_delay, MAX_RETRY_ATTEMPTS};
    use time::Duration;

    // =========================================================================
    // The full dunning cycle spans 1h + 6h + 24h and then terminates
    // =========================================================================
    #[test]
    fn test_full_cycle_duration() {
        let total: Duration = (0..MAX_RETRY_ATTEMPTS).map(backoff_delay).sum();
        assert_eq!(total, Duration::hours(31));
    }

    #[test]
    fn test_delays_are_monotonically_increasing() {
        for attempt in 1..MAX_RETRY_ATTEMPTS {
            assert!(backoff_delay(attempt) >= backoff_delay(attempt - 1));
        }
    }
}

#[cfg(test)]
mod purchase_path_tests {
    use crate::iap::{plan_for_product, synthetic_subscription_id, IapPlatform};
    use gigmatch_shared::SubscriptionTier;

    // =========================================================================
    // Store ids and processor ids live in disjoint namespaces
    // =========================================================================
    #[test]
    fn test_store_and_processor_ids_disjoint() {
        let iap_id = synthetic_subscription_id(IapPlatform::Apple, "sub_12345");
        // Even a transaction id that looks like a Stripe id cannot collide
        assert_ne!(iap_id, "sub_12345");
        assert!(iap_id.starts_with("iap:apple:"));
    }

    // =========================================================================
    // Same transaction id on different platforms maps to different ids
    // =========================================================================
    #[test]
    fn test_platform_namespacing() {
        let txn = "1000000987654321";
        assert_ne!(
            synthetic_subscription_id(IapPlatform::Apple, txn),
            synthetic_subscription_id(IapPlatform::Google, txn)
        );
    }

    // =========================================================================
    // Every store product maps to a paid tier; free is never purchasable
    // =========================================================================
    #[test]
    fn test_products_map_to_paid_tiers() {
        for product in [
            "com.gigmatch.pro.monthly",
            "com.gigmatch.pro.yearly",
            "com.gigmatch.premium.monthly",
            "com.gigmatch.premium.yearly",
        ] {
            let (tier, _) = plan_for_product(product).expect("known product");
            assert_ne!(tier, SubscriptionTier::Free);
        }
    }
}

#[cfg(test)]
mod webhook_tests {
    use crate::webhooks::{compute_signature, parse_signature_header};

    // =========================================================================
    // A signature computed with the wrong secret never validates
    // =========================================================================
    #[test]
    fn test_forged_signature_rejected() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let ts = 1_700_000_000;
        let genuine = compute_signature("whsec_genuine", ts, payload).unwrap();
        let forged = compute_signature("whsec_attacker", ts, payload).unwrap();
        assert_ne!(genuine, forged);
    }

    // =========================================================================
    // Header parsing tolerates extra schemes and reordered fields
    // =========================================================================
    #[test]
    fn test_header_parsing_is_order_insensitive() {
        let a = parse_signature_header("t=1700000000,v1=aaa").unwrap();
        let b = parse_signature_header("v1=aaa,t=1700000000,v0=zzz").unwrap();
        assert_eq!(a, b);
    }

    // =========================================================================
    // Signatures containing '=' padding parse intact
    // =========================================================================
    #[test]
    fn test_header_value_with_equals_sign() {
        let (_, sig) = parse_signature_header("t=1700000000,v1=abc=def").unwrap();
        assert_eq!(sig, "abc=def");
    }
}
