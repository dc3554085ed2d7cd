//! API routes

pub mod billing;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{optional_auth, require_auth},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes - the webhook authenticates via signature, checkout
    // accepts anonymous buyers but attaches identity when a token is present
    let public_api_routes = Router::new()
        .route("/billing/webhook", post(billing::webhook))
        .route(
            "/billing/checkout",
            post(billing::create_checkout).route_layer(middleware::from_fn_with_state(
                auth_state.clone(),
                optional_auth,
            )),
        );

    // Protected API routes (auth required)
    let mut protected_api_routes = Router::new()
        .route("/billing/link", post(billing::link_session))
        .route("/billing/entitlement", get(billing::get_entitlement));

    // Simulation endpoint exists only where a simulator does
    if state.billing.simulator.is_some() {
        protected_api_routes =
            protected_api_routes.route("/billing/simulate", post(billing::simulate));
    }

    let protected_api_routes = protected_api_routes
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        // Webhook payloads are small; anything bigger is not for us
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
