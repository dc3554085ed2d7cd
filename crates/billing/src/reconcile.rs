//! Reconciliation of billing events into entitlement state
//!
//! Both entry paths, asynchronous webhook delivery and the synchronous
//! "link my subscription" call made right after signup, converge here on
//! the same upsert-by-user semantics. Every mutation is "set final state",
//! never "apply delta", so replays and races converge.

use sqlx::PgPool;
use uuid::Uuid;

use crate::entitlement::{EntitlementRecord, EntitlementStore, SubscriptionSnapshot};
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

#[derive(Clone)]
pub struct ReconciliationService {
    store: EntitlementStore,
    event_logger: BillingEventLogger,
}

impl ReconciliationService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: EntitlementStore::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool),
        }
    }

    pub fn store(&self) -> &EntitlementStore {
        &self.store
    }

    /// Persist the entitlement for a resolved checkout.
    ///
    /// Upsert keyed on `user_id`: a replayed event or a second checkout for
    /// the same user updates the existing row in place. Persistence errors
    /// propagate as retryable: the billing side has committed, so silent
    /// divergence is the one outcome we must not allow.
    pub async fn record_checkout(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        actor: ActorType,
        stripe_event_id: Option<&str>,
    ) -> BillingResult<EntitlementRecord> {
        let record = self.store.upsert(user_id, snapshot).await?;

        let mut builder = BillingEventBuilder::new(BillingEventType::CheckoutCompleted)
            .user(user_id)
            .data(serde_json::json!({
                "status": snapshot.status.as_str(),
                "price_id": snapshot.price_id,
                "is_promotional": snapshot.is_promotional,
            }))
            .stripe_subscription(&snapshot.subscription_id)
            .stripe_customer(&snapshot.customer_id)
            .actor_type(actor);
        if let Some(event_id) = stripe_event_id {
            builder = builder.stripe_event(event_id);
        }
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log checkout completed event");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.subscription_id,
            status = %snapshot.status,
            is_promotional = snapshot.is_promotional,
            "Entitlement reconciled from checkout"
        );

        Ok(record)
    }

    /// Persist the entitlement for a session the user linked themselves.
    ///
    /// Same upsert as the webhook path; only the audit trail differs, since
    /// the actor here is the authenticated user, not Stripe.
    pub async fn record_link(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> BillingResult<EntitlementRecord> {
        let record = self.store.upsert(user_id, snapshot).await?;

        let builder = BillingEventBuilder::new(BillingEventType::SubscriptionLinked)
            .user(user_id)
            .data(serde_json::json!({
                "status": snapshot.status.as_str(),
                "price_id": snapshot.price_id,
            }))
            .stripe_subscription(&snapshot.subscription_id)
            .stripe_customer(&snapshot.customer_id)
            .actor_type(ActorType::User);
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log subscription linked event");
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %snapshot.subscription_id,
            "Entitlement linked by user"
        );

        Ok(record)
    }

    /// Record that a paid checkout could not be linked to a local user yet.
    ///
    /// Not an error: the buyer paid before creating an account, and the
    /// synchronous link path will finish the job on their first sign-in.
    pub async fn record_linkage_deferred(
        &self,
        snapshot: &SubscriptionSnapshot,
        stripe_event_id: &str,
    ) -> BillingResult<()> {
        tracing::warn!(
            subscription_id = %snapshot.subscription_id,
            customer_id = %snapshot.customer_id,
            "Checkout completed with no resolvable user; deferring linkage"
        );

        let builder = BillingEventBuilder::new(BillingEventType::LinkageDeferred)
            .data(serde_json::json!({ "status": snapshot.status.as_str() }))
            .stripe_event(stripe_event_id)
            .stripe_subscription(&snapshot.subscription_id)
            .stripe_customer(&snapshot.customer_id)
            .actor_type(ActorType::Stripe);
        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log linkage deferred event");
        }

        Ok(())
    }

    /// Apply a subscription update, keyed by customer id.
    ///
    /// An update for a customer we never linked is a warned no-op; there is
    /// nothing actionable to retry into.
    pub async fn apply_subscription_update(
        &self,
        snapshot: &SubscriptionSnapshot,
        stripe_event_id: &str,
    ) -> BillingResult<()> {
        match self.store.apply_update(snapshot).await? {
            Some(user_id) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(BillingEventType::SubscriptionUpdated)
                            .user(user_id)
                            .data(serde_json::json!({
                                "status": snapshot.status.as_str(),
                                "cancel_at_period_end": snapshot.cancel_at_period_end,
                            }))
                            .stripe_event(stripe_event_id)
                            .stripe_subscription(&snapshot.subscription_id)
                            .stripe_customer(&snapshot.customer_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log subscription updated event");
                }

                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %snapshot.subscription_id,
                    status = %snapshot.status,
                    "Subscription updated"
                );
            }
            None => {
                tracing::warn!(
                    customer_id = %snapshot.customer_id,
                    subscription_id = %snapshot.subscription_id,
                    "Subscription update for unlinked customer; nothing to reconcile"
                );
            }
        }

        Ok(())
    }

    /// Apply a subscription deletion, keyed by subscription id. Idempotent.
    pub async fn apply_subscription_deleted(
        &self,
        subscription_id: &str,
        stripe_event_id: &str,
    ) -> BillingResult<()> {
        match self.store.mark_canceled(subscription_id).await? {
            Some(user_id) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(BillingEventType::SubscriptionCanceled)
                            .user(user_id)
                            .stripe_event(stripe_event_id)
                            .stripe_subscription(subscription_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log subscription canceled event");
                }

                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Subscription canceled"
                );
            }
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription deletion for unknown subscription; nothing to reconcile"
                );
            }
        }

        Ok(())
    }

    /// Apply a failed invoice payment, keyed by customer id.
    pub async fn apply_invoice_failed(
        &self,
        customer_id: &str,
        stripe_event_id: &str,
    ) -> BillingResult<()> {
        match self.store.mark_past_due(customer_id).await? {
            Some(user_id) => {
                if let Err(e) = self
                    .event_logger
                    .log_event(
                        BillingEventBuilder::new(BillingEventType::InvoicePaymentFailed)
                            .user(user_id)
                            .stripe_event(stripe_event_id)
                            .stripe_customer(customer_id)
                            .actor_type(ActorType::Stripe),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to log invoice failed event");
                }

                tracing::warn!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    "Invoice payment failed; entitlement marked past due"
                );
            }
            None => {
                tracing::warn!(
                    customer_id = %customer_id,
                    "Invoice payment failure for unlinked customer; nothing to reconcile"
                );
            }
        }

        Ok(())
    }
}
