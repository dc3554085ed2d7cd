//! Stripe webhook handling
//!
//! Verifies event signatures and dispatches subscription lifecycle events
//! into the reconciliation service. Verification failures are rejected
//! before dispatch and are non-retryable; persistence failures propagate as
//! retryable so the transport can ask Stripe to redeliver.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Invoice, Subscription};

use crate::checkout::{META_INTRO_PRICE, META_RECURRING_PRICE};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::entitlement::SubscriptionSnapshot;
use crate::linkage::{CheckoutLinkage, LinkageResolver};
use crate::reconcile::ReconciliationService;
use crate::schedule::{ScheduleBuilder, SubscriptionScheduler};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header against a payload.
///
/// Manual HMAC-SHA256 verification over `"{t}.{payload}"`; async-stripe's
/// built-in verifier rejects events from newer Stripe API versions.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> BillingResult<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|_| BillingError::WebhookSignatureInvalid)?
        .as_secs() as i64;
    verify_signature_at(payload, signature, secret, now)
}

fn verify_signature_at(
    payload: &str,
    signature: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    // Signature header format: t=timestamp,v1=signature[,v0=signature]
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler<S: SubscriptionScheduler = ScheduleBuilder> {
    stripe: StripeClient,
    reconciliation: ReconciliationService,
    linkage: LinkageResolver,
    schedules: S,
    event_logger: BillingEventLogger,
}

impl WebhookHandler<ScheduleBuilder> {
    pub fn new(
        stripe: StripeClient,
        reconciliation: ReconciliationService,
        linkage: LinkageResolver,
        event_logger: BillingEventLogger,
    ) -> Self {
        let schedules = ScheduleBuilder::new(stripe.clone());
        Self::with_scheduler(stripe, reconciliation, linkage, event_logger, schedules)
    }
}

impl<S: SubscriptionScheduler> WebhookHandler<S> {
    pub fn with_scheduler(
        stripe: StripeClient,
        reconciliation: ReconciliationService,
        linkage: LinkageResolver,
        event_logger: BillingEventLogger,
        schedules: S,
    ) -> Self {
        Self {
            stripe,
            reconciliation,
            linkage,
            schedules,
            event_logger,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        verify_signature(payload, signature, &self.stripe.config().webhook_secret)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Stripe webhook event verified"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// No dedup bookkeeping: every handler converges under replay because
    /// the underlying writes are idempotent upserts keyed on stable ids.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event).await?;
            }
            EventType::CustomerSubscriptionUpdated => {
                let subscription = extract_subscription(event)?;
                let snapshot = SubscriptionSnapshot::from_stripe(&subscription, false);
                self.reconciliation
                    .apply_subscription_update(&snapshot, &event_id)
                    .await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = extract_subscription(event)?;
                self.reconciliation
                    .apply_subscription_deleted(subscription.id.as_str(), &event_id)
                    .await?;
            }
            EventType::InvoicePaymentFailed => {
                let invoice = extract_invoice(event)?;
                match customer_id_of(&invoice.customer) {
                    Some(customer_id) => {
                        self.reconciliation
                            .apply_invoice_failed(&customer_id, &event_id)
                            .await?;
                    }
                    None => {
                        tracing::warn!(
                            invoice_id = %invoice.id,
                            "Invoice payment failure carried no customer; nothing to reconcile"
                        );
                    }
                }
            }
            _ => {
                // Track which events arrive without a handler
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event_id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        // Only subscription-mode checkouts carry a subscription
        let subscription_id = match &session.subscription {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(s)) => s.id.to_string(),
            None => {
                tracing::info!(
                    session_id = %session.id,
                    "Checkout completed without a subscription; nothing to reconcile"
                );
                return Ok(());
            }
        };

        // Always fetch canonical state rather than trusting the embedded copy
        let parsed_sub_id = subscription_id.parse().map_err(|e| {
            tracing::error!("Failed to parse subscription ID: {}", e);
            BillingError::SubscriptionNotFound(subscription_id.clone())
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

        let promo = promotional_prices(&session);
        let snapshot = SubscriptionSnapshot::from_stripe(&subscription, promo.is_some());
        let linkage = CheckoutLinkage::from_session(&session);

        self.reconcile_checkout(snapshot, promo, &linkage, &event_id)
            .await
    }

    /// Reconcile a checkout whose subscription state is already in hand.
    ///
    /// Best-effort scheduling: a failed schedule is a billing remediation
    /// concern, never a reason to withhold the entitlement that was paid
    /// for. The entitlement write happens after, unconditionally.
    pub(crate) async fn reconcile_checkout(
        &self,
        snapshot: SubscriptionSnapshot,
        promo: Option<(String, String)>,
        linkage: &CheckoutLinkage,
        event_id: &str,
    ) -> BillingResult<()> {
        let subscription_id = snapshot.subscription_id.clone();

        if let Some((intro_price, recurring_price)) = promo {
            match self
                .schedules
                .split_first_period(&subscription_id, &intro_price, &recurring_price)
                .await
            {
                Ok(schedule_id) => {
                    if let Err(e) = self
                        .event_logger
                        .log_event(
                            BillingEventBuilder::new(BillingEventType::ScheduleCreated)
                                .data(serde_json::json!({ "schedule_id": schedule_id }))
                                .stripe_event(event_id)
                                .stripe_subscription(&subscription_id)
                                .actor_type(ActorType::Stripe),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to log schedule created event");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Promotional schedule creation failed; entitlement persists unaffected"
                    );
                    if let Err(log_err) = self
                        .event_logger
                        .log_event(
                            BillingEventBuilder::new(BillingEventType::ScheduleFailed)
                                .data(serde_json::json!({ "error": e.to_string() }))
                                .stripe_event(event_id)
                                .stripe_subscription(&subscription_id)
                                .actor_type(ActorType::Stripe),
                        )
                        .await
                    {
                        tracing::warn!(error = %log_err, "Failed to log schedule failed event");
                    }
                }
            }
        }

        match self.linkage.resolve(linkage).await? {
            Some(user_id) => {
                self.reconciliation
                    .record_checkout(user_id, &snapshot, ActorType::Stripe, Some(event_id))
                    .await?;
            }
            None => {
                // Billing succeeded; local linkage waits for the synchronous
                // path after account creation. Acknowledge regardless.
                self.reconciliation
                    .record_linkage_deferred(&snapshot, event_id)
                    .await?;
            }
        }

        Ok(())
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn customer_id_of(customer: &Option<stripe::Expandable<stripe::Customer>>) -> Option<String> {
    match customer {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    }
}

/// Extract the promotional price pair from checkout metadata, if present.
fn promotional_prices(session: &stripe::CheckoutSession) -> Option<(String, String)> {
    let metadata = session.metadata.as_ref()?;
    let intro = metadata.get(META_INTRO_PRICE)?;
    let recurring = metadata.get(META_RECURRING_PRICE)?;
    Some((intro.clone(), recurring.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key";

    fn sign(payload: &str, timestamp: i64) -> String {
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(b"test_secret_key").unwrap();
        mac.update(signed_payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        assert!(verify_signature_at(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        let result = verify_signature_at(r#"{"id":"evt_2"}"#, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at);
        let result =
            verify_signature_at(payload, &header, SECRET, signed_at + SIGNATURE_TOLERANCE_SECS + 1);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_tolerance_is_symmetric() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at);
        // Slight clock skew in either direction is fine
        assert!(verify_signature_at(payload, &header, SECRET, signed_at - 60).is_ok());
        assert!(verify_signature_at(payload, &header, SECRET, signed_at + 60).is_ok());
    }

    #[test]
    fn test_missing_v1_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let result = verify_signature_at(payload, "t=1700000000", SECRET, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        let result = verify_signature_at(payload, &header, "whsec_other_secret", now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    mod checkout_reconciliation {
        use super::super::*;
        use crate::client::{Environment, PriceIds, StripeConfig};
        use crate::entitlement::{BillingInterval, EntitlementStore, SubscriptionStatus};
        use crate::identity::UserDirectory;
        use time::{Duration, OffsetDateTime};
        use uuid::Uuid;

        struct UnavailableScheduler;

        impl SubscriptionScheduler for UnavailableScheduler {
            fn split_first_period(
                &self,
                _subscription_id: &str,
                _intro_price_id: &str,
                _recurring_price_id: &str,
            ) -> impl std::future::Future<Output = BillingResult<String>> + Send {
                std::future::ready(Err(BillingError::ScheduleFailed(
                    "schedule backend unavailable".to_string(),
                )))
            }
        }

        fn test_config() -> StripeConfig {
            StripeConfig {
                secret_key: "sk_test_x".to_string(),
                webhook_secret: "whsec_x".to_string(),
                price_ids: PriceIds {
                    monthly: "price_test_monthly".to_string(),
                    annual: None,
                    intro_monthly: Some("price_test_intro".to_string()),
                },
                app_base_url: "http://localhost:3000".to_string(),
                environment: Environment::Development,
            }
        }

        async fn test_pool() -> sqlx::PgPool {
            let url =
                std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
            sqlx::postgres::PgPoolOptions::new()
                .max_connections(2)
                .connect(&url)
                .await
                .expect("Failed to connect to test database")
        }

        async fn create_user(pool: &sqlx::PgPool) -> Uuid {
            let id = Uuid::new_v4();
            sqlx::query("INSERT INTO users (id, email, display_name) VALUES ($1, $2, 'Test User')")
                .bind(id)
                .bind(format!("test+{}@example.com", id.simple()))
                .execute(pool)
                .await
                .unwrap();
            id
        }

        fn promo_snapshot(subscription_id: &str, customer_id: &str) -> SubscriptionSnapshot {
            let now = OffsetDateTime::now_utc();
            SubscriptionSnapshot {
                subscription_id: subscription_id.to_string(),
                customer_id: customer_id.to_string(),
                price_id: Some("price_test_intro".to_string()),
                interval: BillingInterval::Monthly,
                status: SubscriptionStatus::Active,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
                cancel_at_period_end: false,
                canceled_at: None,
                trial_start: None,
                trial_end: None,
                is_promotional: true,
            }
        }

        #[tokio::test]
        #[ignore]
        async fn schedule_failure_does_not_block_the_entitlement() {
            let pool = test_pool().await;
            let user_id = create_user(&pool).await;
            let tag = Uuid::new_v4().simple().to_string();
            let sub = format!("sub_test_{}", tag);
            let cus = format!("cus_test_{}", tag);
            let event_id = format!("evt_test_{}", tag);

            let handler = WebhookHandler::with_scheduler(
                StripeClient::new(test_config()),
                ReconciliationService::new(pool.clone()),
                LinkageResolver::new(UserDirectory::new(pool.clone())),
                BillingEventLogger::new(pool.clone()),
                UnavailableScheduler,
            );

            let linkage = CheckoutLinkage {
                client_reference_id: Some(user_id.to_string()),
                metadata_user_id: None,
                customer_email: None,
            };
            let promo = Some((
                "price_test_intro".to_string(),
                "price_test_monthly".to_string(),
            ));
            handler
                .reconcile_checkout(promo_snapshot(&sub, &cus), promo, &linkage, &event_id)
                .await
                .unwrap();

            // The entitlement lands promotional and active even though the
            // schedule step failed outright
            let record = EntitlementStore::new(pool.clone())
                .find_by_user(user_id)
                .await
                .unwrap()
                .unwrap();
            assert!(record.is_promotional);
            assert!(record.grants_access());
            assert_eq!(record.stripe_subscription_id.as_deref(), Some(sub.as_str()));

            // And the failure itself is on the audit trail
            let failures: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM billing_events \
                 WHERE stripe_event_id = $1 AND event_type = 'SCHEDULE_FAILED'",
            )
            .bind(&event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(failures.0, 1);
        }
    }
}
