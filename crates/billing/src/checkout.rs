//! Stripe Checkout sessions
//!
//! Session creation stamps every linkage signal we may later need: the
//! buyer's user id as `client_reference_id` and metadata when known, the
//! `anonymous` sentinel when not. The synchronous link path lives here too,
//! for buyers who paid first and created an account after.

use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionStatus, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, Subscription,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::entitlement::{BillingInterval, EntitlementRecord, SubscriptionSnapshot};
use crate::error::{BillingError, BillingResult};
use crate::linkage::{CheckoutLinkage, ANONYMOUS_REF};
use crate::reconcile::ReconciliationService;

/// Checkout metadata keys marking the promotional two-phase offer
pub(crate) const META_INTRO_PRICE: &str = "intro_price_id";
pub(crate) const META_RECURRING_PRICE: &str = "recurring_price_id";

/// Checkout service for creating and linking Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
    reconciliation: ReconciliationService,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, reconciliation: ReconciliationService) -> Self {
        Self {
            stripe,
            reconciliation,
        }
    }

    /// Create a checkout session for a new subscription.
    ///
    /// `user_id` is `None` for buyers without an account yet; the session
    /// then carries the `anonymous` sentinel and linkage resolution falls
    /// back to email, or ultimately to the link path after signup.
    pub async fn create_subscription_checkout(
        &self,
        user_id: Option<Uuid>,
        customer_email: Option<&str>,
        interval: BillingInterval,
        promotional: bool,
    ) -> BillingResult<CheckoutSession> {
        let config = self.stripe.config();

        let recurring_price_id = config
            .price_id_for_interval(interval)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "No price configured for {} billing",
                    interval.as_str()
                ))
            })?
            .to_string();

        // The discounted first period only exists on the monthly plan
        let intro_price_id = if promotional {
            if interval != BillingInterval::Monthly {
                return Err(BillingError::InvalidInput(
                    "Promotional pricing only applies to monthly billing".to_string(),
                ));
            }
            Some(
                config
                    .price_ids
                    .intro_monthly
                    .clone()
                    .ok_or_else(|| {
                        BillingError::InvalidInput(
                            "Promotional pricing is not configured".to_string(),
                        )
                    })?,
            )
        } else {
            None
        };

        let base_url = &config.app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let client_reference = user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| ANONYMOUS_REF.to_string());

        let mut metadata = std::collections::HashMap::new();
        if let Some(user_id) = user_id {
            metadata.insert("user_id".to_string(), user_id.to_string());
        }
        metadata.insert("interval".to_string(), interval.as_str().to_string());
        if let Some(intro) = &intro_price_id {
            // The webhook reads these back to build the two-phase schedule
            metadata.insert(META_INTRO_PRICE.to_string(), intro.clone());
            metadata.insert(META_RECURRING_PRICE.to_string(), recurring_price_id.clone());
        }

        // The intro price is what the session charges; the schedule swaps in
        // the recurring price from the second cycle on
        let charged_price = intro_price_id.as_deref().unwrap_or(&recurring_price_id);

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(charged_price.to_string()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            client_reference_id: Some(&client_reference),
            customer_email,
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Auto),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            session_id = %session.id,
            interval = %interval.as_str(),
            promotional = promotional,
            anonymous = user_id.is_none(),
            "Created checkout session"
        );

        Ok(session)
    }

    /// Link a completed checkout session to the authenticated user.
    ///
    /// Covers the pay-first-sign-up-later flow: the webhook already arrived,
    /// found no account, and deferred. The caller proves who they are via
    /// auth; the session id proves which purchase is theirs. Refuses a
    /// session that already belongs to someone else.
    pub async fn link_session(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> BillingResult<EntitlementRecord> {
        let session = self.get_session(session_id).await?;

        if session.status != Some(CheckoutSessionStatus::Complete) {
            return Err(BillingError::InvalidInput(
                "Checkout session is not complete".to_string(),
            ));
        }

        let linkage = CheckoutLinkage::from_session(&session);
        if let Some(referenced) = linkage.preferred_reference() {
            if referenced != user_id {
                tracing::warn!(
                    user_id = %user_id,
                    referenced = %referenced,
                    session_id = %session_id,
                    "Refusing to link a session referencing a different user"
                );
                return Err(BillingError::InvalidInput(
                    "Checkout session belongs to a different account".to_string(),
                ));
            }
        }

        let subscription_id = match &session.subscription {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(s)) => s.id.to_string(),
            None => {
                return Err(BillingError::InvalidInput(
                    "Checkout session has no subscription".to_string(),
                ))
            }
        };

        let parsed_sub_id = subscription_id.parse().map_err(|e| {
            tracing::error!("Failed to parse subscription ID: {}", e);
            BillingError::SubscriptionNotFound(subscription_id.clone())
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

        // Promo detection: the session metadata is authoritative, but an
        // intro price on the live subscription means the same thing
        let metadata_says_promo = session
            .metadata
            .as_ref()
            .map(|m| m.contains_key(META_INTRO_PRICE))
            .unwrap_or(false);
        let mut snapshot = SubscriptionSnapshot::from_stripe(&subscription, metadata_says_promo);
        if let Some(price_id) = snapshot.price_id.as_deref() {
            if self.stripe.config().is_intro_price(price_id) {
                snapshot.is_promotional = true;
            }
        }

        // Same upsert as the webhook path: if the webhook already landed this
        // subscription (or lands it again later), the row converges
        self.reconciliation.record_link(user_id, &snapshot).await
    }

    /// Retrieve a checkout session by ID
    pub async fn get_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let session_id = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|_| BillingError::SessionNotFound(session_id.to_string()))?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &session_id, &[]).await?;
        Ok(session)
    }
}

/// Response for creating a checkout session
#[derive(Debug, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

impl From<CheckoutSession> for CheckoutResponse {
    fn from(session: CheckoutSession) -> Self {
        Self {
            session_id: session.id.to_string(),
            url: session.url,
        }
    }
}
