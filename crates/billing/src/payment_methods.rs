//! Payment method management
//!
//! Attach/detach/list card payment methods against Stripe, mirroring masked
//! display fields locally so the client never needs a processor call to
//! render them. At most one default per account.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    AttachPaymentMethod, CustomerInvoiceSettings, ListPaymentMethods, PaymentMethod,
    PaymentMethodId, UpdateCustomer,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};

/// A stored payment method (masked display fields only)
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub stripe_payment_method_id: String,
    pub method_type: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub is_default: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PaymentMethodRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            stripe_payment_method_id: row.try_get("stripe_payment_method_id")?,
            method_type: row.try_get("method_type")?,
            brand: row.try_get("brand")?,
            last4: row.try_get("last4")?,
            is_default: row.try_get("is_default")?,
        })
    }
}

/// Payment method service
pub struct PaymentMethodService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PaymentMethodService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// List an account's payment methods from the local mirror
    pub async fn list(&self, account_id: Uuid) -> BillingResult<Vec<PaymentMethodRecord>> {
        let methods: Vec<PaymentMethodRecord> = sqlx::query_as(
            r#"
            SELECT * FROM payment_methods
            WHERE account_id = $1
            ORDER BY is_default DESC, created_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(methods)
    }

    /// Attach a payment method to the account's Stripe customer and mirror
    /// its masked display fields.
    pub async fn attach(
        &self,
        account_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<PaymentMethodRecord> {
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer_id = customers.get_customer_id(account_id).await?;

        let pm_id = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))?;

        let pm = PaymentMethod::attach(
            self.stripe.inner(),
            &pm_id,
            AttachPaymentMethod {
                customer: customer_id,
            },
        )
        .await?;

        let card = pm.card.as_ref();
        let brand = card.map(|c| format!("{:?}", c.brand).to_lowercase());
        let last4 = card.map(|c| c.last4.clone());

        // First attached method becomes the default
        let has_default: Option<(bool,)> = sqlx::query_as(
            "SELECT TRUE FROM payment_methods WHERE account_id = $1 AND is_default LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        let make_default = has_default.is_none();

        let record: PaymentMethodRecord = sqlx::query_as(
            r#"
            INSERT INTO payment_methods (
                id, account_id, stripe_payment_method_id, method_type, brand, last4,
                is_default, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'card', $4, $5, $6, NOW(), NOW())
            ON CONFLICT (stripe_payment_method_id) DO UPDATE SET
                brand = EXCLUDED.brand,
                last4 = EXCLUDED.last4,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(pm.id.as_str())
        .bind(&brand)
        .bind(&last4)
        .bind(make_default)
        .fetch_one(&self.pool)
        .await?;

        if make_default {
            self.set_default_at_processor(account_id, &pm.id).await?;
        }

        tracing::info!(
            account_id = %account_id,
            payment_method_id = %pm.id,
            "Attached payment method"
        );

        Ok(record)
    }

    /// Detach a payment method from the account
    pub async fn detach(&self, account_id: Uuid, payment_method_id: &str) -> BillingResult<()> {
        let owned: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payment_methods WHERE account_id = $1 AND stripe_payment_method_id = $2",
        )
        .bind(account_id)
        .bind(payment_method_id)
        .fetch_optional(&self.pool)
        .await?;

        if owned.is_none() {
            return Err(BillingError::NotFound(format!(
                "Payment method {} not found",
                payment_method_id
            )));
        }

        let pm_id = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))?;

        PaymentMethod::detach(self.stripe.inner(), &pm_id).await?;

        sqlx::query(
            "DELETE FROM payment_methods WHERE account_id = $1 AND stripe_payment_method_id = $2",
        )
        .bind(account_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            payment_method_id = %payment_method_id,
            "Detached payment method"
        );

        Ok(())
    }

    /// Set the default payment method for an account.
    ///
    /// The single UPDATE flips the flag on across the account's methods, so
    /// exactly one row ends up default.
    pub async fn set_default(&self, account_id: Uuid, payment_method_id: &str) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE payment_methods
            SET is_default = (stripe_payment_method_id = $2), updated_at = NOW()
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Payment method {} not found",
                payment_method_id
            )));
        }

        let pm_id = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))?;

        self.set_default_at_processor(account_id, &pm_id).await?;

        tracing::info!(
            account_id = %account_id,
            payment_method_id = %payment_method_id,
            "Set default payment method"
        );

        Ok(())
    }

    /// Refresh the local mirror from Stripe (fallback for missed updates)
    pub async fn sync_from_processor(&self, account_id: Uuid) -> BillingResult<u64> {
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer_id = customers.get_customer_id(account_id).await?;

        let mut params = ListPaymentMethods::new();
        params.customer = Some(customer_id);

        let list = PaymentMethod::list(self.stripe.inner(), &params).await?;

        let mut synced = 0u64;
        for pm in &list.data {
            let card = pm.card.as_ref();
            sqlx::query(
                r#"
                INSERT INTO payment_methods (
                    id, account_id, stripe_payment_method_id, method_type, brand, last4,
                    is_default, created_at, updated_at
                )
                VALUES ($1, $2, $3, 'card', $4, $5, FALSE, NOW(), NOW())
                ON CONFLICT (stripe_payment_method_id) DO UPDATE SET
                    brand = EXCLUDED.brand,
                    last4 = EXCLUDED.last4,
                    updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(pm.id.as_str())
            .bind(card.map(|c| format!("{:?}", c.brand).to_lowercase()))
            .bind(card.map(|c| c.last4.clone()))
            .execute(&self.pool)
            .await?;
            synced += 1;
        }

        Ok(synced)
    }

    async fn set_default_at_processor(
        &self,
        account_id: Uuid,
        pm_id: &PaymentMethodId,
    ) -> BillingResult<()> {
        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer_id = customers.get_customer_id(account_id).await?;

        let mut params = UpdateCustomer::default();
        params.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(pm_id.to_string()),
            ..Default::default()
        });

        stripe::Customer::update(self.stripe.inner(), &customer_id, params).await?;

        Ok(())
    }
}
