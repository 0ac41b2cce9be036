//! Billing endpoints
//!
//! Client-facing subscription operations plus the inbound Stripe webhook.
//! The webhook handler reads the raw, unparsed body for signature
//! verification and returns 200 for every acknowledged event; a non-200 is
//! reserved for signature failure so the processor retries only those.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gigmatch_billing::{
    BillingInterval, CheckoutOutcome, CheckoutResponse, IapPlatform, Plan, PortalResponse,
};
use gigmatch_shared::{SubscriptionTier, UsageCounter};

use crate::{
    error::{ApiError, ApiResult},
    routes::AccountId,
    state::AppState,
};

/// Load the contact fields needed for processor customer creation
async fn account_contact(state: &AppState, account_id: Uuid) -> ApiResult<(String, String)> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT email, display_name FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&state.pool)
            .await?;

    row.ok_or_else(|| ApiError::NotFound(format!("Account {} not found", account_id)))
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

/// GET /api/v1/billing/plans
pub async fn get_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let plans = state
        .billing
        .catalog
        .plans()
        .into_iter()
        .cloned()
        .collect();

    Ok(Json(PlansResponse { plans }))
}

// ============================================================================
// Subscription
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub tier: SubscriptionTier,
    pub status: Option<String>,
    pub is_yearly_billing: bool,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    pub boosts_used_this_month: i32,
    pub gig_applications_this_month: i32,
}

/// GET /api/v1/billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<SubscriptionResponse>> {
    let record = state.billing.subscriptions.get_subscription(account_id).await?;

    let response = match record {
        Some(r) => SubscriptionResponse {
            tier: if r.status.is_entitled() {
                r.tier
            } else {
                SubscriptionTier::Free
            },
            status: Some(r.status.to_string()),
            is_yearly_billing: r.is_yearly_billing,
            cancel_at_period_end: r.cancel_at_period_end,
            current_period_end: r.current_period_end.map(|t| t.unix_timestamp()),
            trial_end: r.trial_end.map(|t| t.unix_timestamp()),
            boosts_used_this_month: r.boosts_used_this_month,
            gig_applications_this_month: r.gig_applications_this_month,
        },
        None => SubscriptionResponse {
            tier: SubscriptionTier::Free,
            status: None,
            is_yearly_billing: false,
            cancel_at_period_end: false,
            current_period_end: None,
            trial_end: None,
            boosts_used_this_month: 0,
            gig_applications_this_month: 0,
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub tier: SubscriptionTier,
    #[serde(default)]
    pub interval: BillingInterval,
}

/// POST /api/v1/billing/subscription/change-plan
pub async fn change_plan(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let record = state
        .billing
        .subscriptions
        .change_plan(account_id, req.tier, req.interval.is_yearly())
        .await?;

    Ok(Json(SubscriptionResponse {
        tier: record.tier,
        status: Some(record.status.to_string()),
        is_yearly_billing: record.is_yearly_billing,
        cancel_at_period_end: record.cancel_at_period_end,
        current_period_end: record.current_period_end.map(|t| t.unix_timestamp()),
        trial_end: record.trial_end.map(|t| t.unix_timestamp()),
        boosts_used_this_month: record.boosts_used_this_month,
        gig_applications_this_month: record.gig_applications_this_month,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    /// Cancel immediately instead of at period end
    #[serde(default)]
    pub immediate: bool,
}

/// POST /api/v1/billing/subscription/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Query(params): Query<CancelParams>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .subscriptions
        .cancel(account_id, params.immediate)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/billing/subscription/resume
pub async fn resume_subscription(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<StatusCode> {
    state.billing.subscriptions.resume(account_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    pub tier: SubscriptionTier,
    #[serde(default = "default_trial_days")]
    pub trial_days: u32,
}

fn default_trial_days() -> u32 {
    7
}

/// POST /api/v1/billing/subscription/trial
pub async fn start_trial(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(req): Json<StartTrialRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    if req.trial_days == 0 || req.trial_days > 30 {
        return Err(ApiError::BadRequest(
            "trial_days must be between 1 and 30".to_string(),
        ));
    }

    let (email, name) = account_contact(&state, account_id).await?;

    let record = state
        .billing
        .subscriptions
        .start_trial(account_id, &email, &name, req.tier, req.trial_days)
        .await?;

    Ok(Json(SubscriptionResponse {
        tier: record.tier,
        status: Some(record.status.to_string()),
        is_yearly_billing: record.is_yearly_billing,
        cancel_at_period_end: record.cancel_at_period_end,
        current_period_end: record.current_period_end.map(|t| t.unix_timestamp()),
        trial_end: record.trial_end.map(|t| t.unix_timestamp()),
        boosts_used_this_month: record.boosts_used_this_month,
        gig_applications_this_month: record.gig_applications_this_month,
    }))
}

// ============================================================================
// Checkout
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub tier: SubscriptionTier,
    #[serde(default)]
    pub interval: BillingInterval,
    pub success_url: String,
    pub cancel_url: String,
}

/// POST /api/v1/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let (email, name) = account_contact(&state, account_id).await?;

    let response = state
        .billing
        .checkout
        .create_checkout(
            account_id,
            &email,
            &name,
            req.tier,
            req.interval,
            &req.success_url,
            &req.cancel_url,
        )
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct VerifyCheckoutRequest {
    pub session_id: String,
}

/// POST /api/v1/billing/checkout/verify
///
/// Safe to poll: an unpaid session reports pending without mutating state.
pub async fn verify_checkout(
    State(state): State<AppState>,
    Json(req): Json<VerifyCheckoutRequest>,
) -> ApiResult<Json<CheckoutOutcome>> {
    let outcome = state.billing.checkout.verify_checkout(&req.session_id).await?;

    Ok(Json(outcome))
}

// ============================================================================
// Payment methods
// ============================================================================

/// GET /api/v1/billing/payment-methods
pub async fn list_payment_methods(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<serde_json::Value>> {
    let methods = state.billing.payment_methods.list(account_id).await?;

    Ok(Json(serde_json::json!({ "payment_methods": methods })))
}

#[derive(Debug, Deserialize)]
pub struct AttachPaymentMethodRequest {
    pub payment_method_id: String,
}

/// POST /api/v1/billing/payment-methods
pub async fn attach_payment_method(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(req): Json<AttachPaymentMethodRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .billing
        .payment_methods
        .attach(account_id, &req.payment_method_id)
        .await?;

    Ok(Json(serde_json::json!({ "payment_method": record })))
}

/// DELETE /api/v1/billing/payment-methods/:payment_method_id
pub async fn detach_payment_method(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .payment_methods
        .detach(account_id, &payment_method_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/billing/payment-methods/:payment_method_id/default
pub async fn set_default_payment_method(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(payment_method_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .payment_methods
        .set_default(account_id, &payment_method_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Portal & invoices
// ============================================================================

/// POST /api/v1/billing/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
) -> ApiResult<Json<PortalResponse>> {
    let response = state
        .billing
        .portal
        .create_portal_session(account_id)
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesParams {
    #[serde(default = "default_invoice_limit")]
    pub limit: i64,
}

fn default_invoice_limit() -> i64 {
    24
}

/// GET /api/v1/billing/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Query(params): Query<ListInvoicesParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = params.limit.clamp(1, 100);
    let invoices = state.billing.invoices.list_invoices(account_id, limit).await?;

    Ok(Json(serde_json::json!({ "invoices": invoices })))
}

// ============================================================================
// Entitlements & usage
// ============================================================================

/// GET /api/v1/billing/features/:feature/access
pub async fn check_feature_access(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(feature): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let check = state
        .billing
        .entitlement
        .check_access(account_id, &feature)
        .await?;

    Ok(Json(serde_json::json!({
        "feature": feature,
        "can_access": check.can_access,
        "tier": check.tier,
    })))
}

fn parse_counter(counter: &str) -> ApiResult<UsageCounter> {
    counter
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Unknown usage counter: {}", counter)))
}

/// GET /api/v1/billing/usage/:counter
pub async fn check_usage(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(counter): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let counter = parse_counter(&counter)?;
    let check = state
        .billing
        .entitlement
        .check_usage_limit(account_id, counter)
        .await?;

    Ok(Json(serde_json::json!({
        "counter": counter.to_string(),
        "can_access": check.can_access,
        "limit": check.limit,
        "used": check.used,
        "remaining": check.remaining,
    })))
}

/// POST /api/v1/billing/usage/:counter/use
pub async fn use_counter(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Path(counter): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let counter = parse_counter(&counter)?;
    let check = state
        .billing
        .entitlement
        .record_usage(account_id, counter)
        .await?;

    Ok(Json(serde_json::json!({
        "counter": counter.to_string(),
        "used": check.used,
        "remaining": check.remaining,
    })))
}

// ============================================================================
// IAP
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IapReceiptRequest {
    pub platform: IapPlatform,
    pub receipt: String,
}

/// POST /api/v1/billing/iap/receipt
pub async fn submit_iap_receipt(
    State(state): State<AppState>,
    AccountId(account_id): AccountId,
    Json(req): Json<IapReceiptRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .billing
        .iap
        .validate_receipt(account_id, req.platform, &req.receipt)
        .await?;

    Ok(Json(serde_json::json!({
        "tier": record.tier,
        "status": record.status.to_string(),
        "current_period_end": record.current_period_end.map(|t| t.unix_timestamp()),
    })))
}

// ============================================================================
// Webhook
// ============================================================================

/// POST /api/v1/billing/webhook
///
/// Body must stay raw (unparsed) for signature verification. Every verified
/// event is acknowledged with 200 even if its business logic failed; the
/// failure is recorded on the idempotency ledger for operator follow-up.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook ledger error: {}", e);
        ApiError::Database(format!("Webhook ledger error: {}", e))
    })?;

    Ok(StatusCode::OK)
}
