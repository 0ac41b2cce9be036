//! Stripe Billing Portal

use sqlx::PgPool;
use stripe::{BillingPortalSession, CreateBillingPortalSession};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::BillingResult;

/// Portal service for Stripe billing portal sessions
pub struct PortalService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PortalService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a billing portal session for an account
    pub async fn create_portal_session(&self, account_id: Uuid) -> BillingResult<PortalResponse> {
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer_id = customers.get_customer_id(account_id).await?;

        let return_url = format!("{}/billing", self.stripe.config().app_base_url);

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %session.customer,
            "Created billing portal session"
        );

        Ok(PortalResponse { url: session.url })
    }
}

/// Response for creating a portal session
#[derive(Debug, serde::Serialize)]
pub struct PortalResponse {
    pub url: String,
}
