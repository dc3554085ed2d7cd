//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Deployment environment.
///
/// Capabilities that must never exist in production (synthetic checkout
/// events, for one) key off this rather than off request-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Environment::Development,
            _ => Environment::Production,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for the subscription plans
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
    /// Deployment environment
    pub environment: Environment,
}

/// Stripe price IDs for the subscription plans
#[derive(Debug, Clone)]
pub struct PriceIds {
    /// Standard monthly plan
    pub monthly: String,
    /// Annual plan
    pub annual: Option<String>,
    /// Discounted first-period price for the promotional offer
    pub intro_monthly: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                monthly: std::env::var("STRIPE_PRICE_MONTHLY")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_MONTHLY not set".to_string()))?,
                annual: std::env::var("STRIPE_PRICE_ANNUAL").ok(),
                intro_monthly: std::env::var("STRIPE_PRICE_INTRO_MONTHLY").ok(),
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            environment: std::env::var("REELGATE_ENV")
                .map(|v| Environment::from_str(&v))
                .unwrap_or_default(),
        })
    }

    /// Get the price ID for a billing interval
    pub fn price_id_for_interval(&self, interval: crate::entitlement::BillingInterval) -> Option<&str> {
        match interval {
            crate::entitlement::BillingInterval::Monthly => Some(&self.price_ids.monthly),
            crate::entitlement::BillingInterval::Annual => self.price_ids.annual.as_deref(),
        }
    }

    /// Whether a price ID is the discounted first-period price
    pub fn is_intro_price(&self, price_id: &str) -> bool {
        self.price_ids.intro_monthly.as_deref() == Some(price_id)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
