//! Stripe customer management

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Customer service for managing Stripe customers
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create or get a Stripe customer for an account
    pub async fn get_or_create_customer(
        &self,
        account_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer> {
        // Check if the account already has a Stripe customer ID
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((Some(customer_id),)) = existing {
            let customer_id = customer_id
                .parse::<CustomerId>()
                .map_err(|e| BillingError::ExternalService(format!("Invalid customer ID: {}", e)))?;

            let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;

            return Ok(customer);
        }

        self.create_customer(account_id, email, name).await
    }

    /// Create a new Stripe customer
    pub async fn create_customer(
        &self,
        account_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("platform".to_string(), "gigmatch".to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        // Persist the correlation ID
        sqlx::query(
            "UPDATE accounts SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer.id.as_str())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer)
    }

    /// Get the Stripe customer ID for an account
    pub async fn get_customer_id(&self, account_id: Uuid) -> BillingResult<CustomerId> {
        let result: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        match result {
            Some((Some(id),)) => id.parse::<CustomerId>().map_err(|e| {
                BillingError::ExternalService(format!("Invalid customer ID: {}", e))
            }),
            _ => Err(BillingError::CustomerNotFound(account_id.to_string())),
        }
    }

    /// Resolve the account a Stripe customer belongs to
    pub async fn account_id_for_customer(&self, customer_id: &str) -> BillingResult<Uuid> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        result
            .map(|(id,)| id)
            .ok_or(BillingError::CustomerNotFound(customer_id.to_string()))
    }
}
