// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! GigMatch Billing Module
//!
//! Subscription lifecycle and billing reconciliation for the GigMatch
//! platform. Drives purchase flows through Stripe, keeps the local view of
//! each subscription consistent with the processor's ledger as it changes
//! asynchronously, and resolves feature entitlements from already-reconciled
//! local state.
//!
//! ## Features
//!
//! - **Plan Catalog**: Tier definitions, prices, and entitlement sets
//! - **Subscription Records**: One record per account, atomic upserts
//! - **Checkout**: Hosted sessions with idempotent verification
//! - **Webhooks**: Signed event ingestion with an idempotency ledger
//! - **Dunning**: Bounded payment-failure retries with forced downgrade
//! - **Entitlements**: Feature gating without processor calls
//! - **IAP Receipts**: Mobile store purchases converging on the same record
//! - **Payment Methods / Invoices / Portal**: Account billing surfaces

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod dunning;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod iap;
pub mod invoices;
pub mod notify;
pub mod payment_methods;
pub mod portal;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{Plan, PlanCatalog};

// Checkout
pub use checkout::{BillingInterval, CheckoutOutcome, CheckoutResponse, CheckoutService};

// Client
pub use client::{Environment, PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Dunning
pub use dunning::{backoff_delay, DunningService, MAX_RETRY_ATTEMPTS};

// Entitlement
pub use entitlement::{AccessCheck, EntitlementService, UsageCheck};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// IAP
pub use iap::{IapConfig, IapPlatform, IapService, StoreVerification};

// Invoices
pub use invoices::{InvoiceRecord, InvoiceService};

// Notify
pub use notify::{NotificationClient, NotifyConfig};

// Payment methods
pub use payment_methods::{PaymentMethodRecord, PaymentMethodService};

// Portal
pub use portal::{PortalResponse, PortalService};

// Subscriptions
pub use subscriptions::{map_stripe_status, SubscriptionRecord, SubscriptionService};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub dunning: DunningService,
    pub entitlement: EntitlementService,
    pub events: BillingEventLogger,
    pub iap: IapService,
    pub invoices: InvoiceService,
    pub notify: NotificationClient,
    pub payment_methods: PaymentMethodService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let notify = NotificationClient::from_env();

        Self {
            catalog: PlanCatalog::from_config(stripe.config()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            dunning: DunningService::new(stripe.clone(), pool.clone(), notify.clone()),
            entitlement: EntitlementService::new(pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            iap: IapService::from_env(stripe.clone(), pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            notify: notify.clone(),
            payment_methods: PaymentMethodService::new(stripe.clone(), pool.clone()),
            portal: PortalService::new(stripe.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, notify),
        }
    }
}
