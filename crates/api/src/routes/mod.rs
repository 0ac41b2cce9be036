//! API routes

pub mod billing;
pub mod health;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Authenticated account id, forwarded by the platform gateway.
///
/// Authentication itself lives upstream; this service trusts the
/// `x-account-id` header set by the gateway after token verification.
pub struct AccountId(pub Uuid);

#[async_trait]
impl FromRequestParts<AppState> for AccountId {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-account-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .map(AccountId)
            .ok_or_else(|| ApiError::BadRequest("Missing or invalid x-account-id".to_string()))
    }
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let billing_routes = Router::new()
        .route("/plans", get(billing::get_plans))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/change-plan", post(billing::change_plan))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route("/subscription/resume", post(billing::resume_subscription))
        .route("/subscription/trial", post(billing::start_trial))
        .route("/checkout", post(billing::create_checkout))
        .route("/checkout/verify", post(billing::verify_checkout))
        .route(
            "/payment-methods",
            get(billing::list_payment_methods).post(billing::attach_payment_method),
        )
        .route(
            "/payment-methods/:payment_method_id",
            delete(billing::detach_payment_method),
        )
        .route(
            "/payment-methods/:payment_method_id/default",
            post(billing::set_default_payment_method),
        )
        .route("/portal", post(billing::create_portal_session))
        .route("/invoices", get(billing::list_invoices))
        .route("/features/:feature/access", get(billing::check_feature_access))
        .route("/usage/:counter", get(billing::check_usage))
        .route("/usage/:counter/use", post(billing::use_counter))
        .route("/iap/receipt", post(billing::submit_iap_receipt))
        .route("/webhook", post(billing::webhook));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1/billing", billing_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
