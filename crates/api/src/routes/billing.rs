//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use reelgate_billing::{
    BillingInterval, CheckoutResponse, EntitlementRecord, SimulatedEvent, SimulationResult,
};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    /// Billing interval (monthly or annual); defaults to monthly
    pub interval: Option<String>,
    /// Opt into the discounted-first-period offer
    #[serde(default)]
    pub promotional: bool,
    /// Pre-fill for anonymous buyers; ignored for signed-in callers, whose
    /// account email is authoritative
    pub email: Option<String>,
}

/// Request to link a completed checkout session to the caller's account
#[derive(Debug, Deserialize)]
pub struct LinkSessionRequest {
    pub session_id: String,
}

/// Server-authoritative entitlement view
#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub entitled: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
    pub is_promotional: bool,
}

impl From<EntitlementRecord> for EntitlementResponse {
    fn from(record: EntitlementRecord) -> Self {
        let entitled = record.grants_access();
        Self {
            entitled,
            status: record.status,
            billing_interval: Some(record.billing_interval),
            current_period_end: record
                .current_period_end
                .format(&time::format_description::well_known::Rfc3339)
                .ok(),
            cancel_at_period_end: record.cancel_at_period_end,
            is_promotional: record.is_promotional,
        }
    }
}

impl EntitlementResponse {
    fn none() -> Self {
        Self {
            entitled: false,
            status: "none".to_string(),
            billing_interval: None,
            current_period_end: None,
            cancel_at_period_end: false,
            is_promotional: false,
        }
    }
}

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    // Retryable failures surface as 5xx so Stripe redelivers; the handlers
    // are replay-safe. Permanent failures map to their 4xx status.
    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}

/// Create a checkout session. Works signed-in or anonymous.
pub async fn create_checkout(
    State(state): State<AppState>,
    auth_user: Option<Extension<AuthUser>>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let interval = match req.interval.as_deref() {
        Some(raw) => BillingInterval::from_str(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown billing interval: {}", raw)))?,
        None => BillingInterval::Monthly,
    };

    let (user_id, email) = match &auth_user {
        Some(Extension(user)) => (Some(user.user_id), Some(user.email.as_str())),
        None => (None, req.email.as_deref()),
    };

    let session = state
        .billing
        .checkout
        .create_subscription_checkout(user_id, email, interval, req.promotional)
        .await?;

    Ok(Json(session.into()))
}

/// Link a completed checkout session to the caller's account
pub async fn link_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<LinkSessionRequest>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let record = state
        .billing
        .checkout
        .link_session(auth_user.user_id, &req.session_id)
        .await?;

    Ok(Json(record.into()))
}

/// The caller's current entitlement, straight from the database.
///
/// Clients never decide access themselves; this endpoint is the only
/// entitlement source they get.
pub async fn get_entitlement(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let record = state
        .billing
        .reconciliation
        .store()
        .find_by_user(auth_user.user_id)
        .await?;

    Ok(Json(
        record.map(EntitlementResponse::from).unwrap_or_else(EntitlementResponse::none),
    ))
}

/// Feed a synthetic event through reconciliation. Admin only, and the route
/// is only mounted when a simulator exists (never in production).
pub async fn simulate(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SimulatedEvent>,
) -> Result<Json<SimulationResult>, ApiError> {
    if !auth_user.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let simulator = state
        .billing
        .simulator
        .as_ref()
        .ok_or(ApiError::NotFound)?;

    let result = simulator.dispatch(req).await?;
    Ok(Json(result))
}
