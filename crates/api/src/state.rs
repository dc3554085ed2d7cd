//! Shared application state

use std::sync::Arc;

use reelgate_billing::{
    BillingEventLogger, BillingResult, CheckoutService, EventSimulator, LinkageResolver,
    ReconciliationService, StripeClient, UserDirectory, WebhookHandler,
};
use sqlx::PgPool;

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

/// Billing services, wired once at startup
pub struct BillingState {
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub reconciliation: ReconciliationService,
    /// Present only outside production
    pub simulator: Option<EventSimulator>,
}

impl BillingState {
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let reconciliation = ReconciliationService::new(pool.clone());
        let linkage = LinkageResolver::new(UserDirectory::new(pool.clone()));
        let event_logger = BillingEventLogger::new(pool);

        let simulator = EventSimulator::new(stripe.config(), reconciliation.clone());
        let checkout = CheckoutService::new(stripe.clone(), reconciliation.clone());
        let webhooks = WebhookHandler::new(stripe, reconciliation.clone(), linkage, event_logger);

        Ok(Self {
            checkout,
            webhooks,
            reconciliation,
            simulator,
        })
    }
}

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingState>,
    auth: AuthState,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingState) -> Self {
        let auth = AuthState {
            jwt: JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours),
        };
        Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
            auth,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
