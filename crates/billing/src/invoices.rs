//! Invoice ledger
//!
//! Append-only record of processor invoices, idempotent on the external
//! invoice id. Created from `invoice.*` webhooks and checkout verification;
//! re-delivery updates status fields without creating duplicates.

use serde::Serialize;
use sqlx::PgPool;
use stripe::Invoice;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A stored invoice record
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub stripe_invoice_id: String,
    pub amount_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: String,
    pub description: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for InvoiceRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            stripe_invoice_id: row.try_get("stripe_invoice_id")?,
            amount_cents: row.try_get("amount_cents")?,
            amount_paid_cents: row.try_get("amount_paid_cents")?,
            currency: row.try_get("currency")?,
            status: row.try_get("status")?,
            description: row.try_get("description")?,
            hosted_invoice_url: row.try_get("hosted_invoice_url")?,
            paid_at: row.try_get("paid_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Invoice service backed by the append-only ledger
pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert an invoice from a processor invoice object.
    ///
    /// Only the mutable status fields are updated on conflict; the ledger
    /// never grows a second row for the same external id.
    pub async fn upsert_from_stripe(
        &self,
        account_id: Uuid,
        invoice: &Invoice,
        status: &str,
    ) -> BillingResult<Uuid> {
        let paid_at = if status == "paid" {
            Some(OffsetDateTime::now_utc())
        } else {
            None
        };

        let to_ts = |t: i64| OffsetDateTime::from_unix_timestamp(t).ok();
        let period_start = invoice.period_start.and_then(to_ts);
        let period_end = invoice.period_end.and_then(to_ts);

        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                id, account_id, stripe_invoice_id, amount_cents, amount_paid_cents,
                currency, status, description, hosted_invoice_url, invoice_pdf_url,
                period_start, period_end, paid_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW()
            )
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                status = EXCLUDED.status,
                amount_paid_cents = EXCLUDED.amount_paid_cents,
                hosted_invoice_url = EXCLUDED.hosted_invoice_url,
                invoice_pdf_url = EXCLUDED.invoice_pdf_url,
                paid_at = COALESCE(EXCLUDED.paid_at, invoices.paid_at),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(invoice.id.as_str())
        .bind(invoice.total.unwrap_or(0))
        .bind(invoice.amount_paid.unwrap_or(0))
        .bind(
            invoice
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
        )
        .bind(status)
        .bind(invoice.description.as_ref())
        .bind(invoice.hosted_invoice_url.as_ref())
        .bind(invoice.invoice_pdf.as_ref())
        .bind(period_start)
        .bind(period_end)
        .bind(paid_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            account_id = %account_id,
            stripe_invoice_id = %invoice.id,
            status = %status,
            "Stored invoice"
        );

        Ok(id.0)
    }

    /// Record a paid invoice from a verified checkout session. Idempotent on
    /// the external invoice id, so re-verifying a session is a no-op.
    pub async fn record_paid_checkout(
        &self,
        account_id: Uuid,
        stripe_invoice_id: &str,
        amount_cents: i64,
        description: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, account_id, stripe_invoice_id, amount_cents, amount_paid_cents,
                currency, status, description, paid_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $4, 'usd', 'paid', $5, NOW(), NOW(), NOW())
            ON CONFLICT (stripe_invoice_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(stripe_invoice_id)
        .bind(amount_cents)
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List invoices for an account, newest first
    pub async fn list_invoices(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let invoices: Vec<InvoiceRecord> = sqlx::query_as(
            r#"
            SELECT * FROM invoices
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }
}
