//! Append-only billing event log
//!
//! Audit trail for billing activity: answers "why is this user entitled?"
//! after the fact. Deliberately not consulted for idempotency; replay
//! safety comes from the entitlement upsert, and a dedup table would be a
//! second source of truth that can drift.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    CheckoutCompleted,
    SubscriptionLinked,
    SubscriptionUpdated,
    SubscriptionCanceled,
    InvoicePaymentFailed,
    LinkageDeferred,
    ScheduleCreated,
    ScheduleFailed,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::SubscriptionLinked => "SUBSCRIPTION_LINKED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::InvoicePaymentFailed => "INVOICE_PAYMENT_FAILED",
            BillingEventType::LinkageDeferred => "LINKAGE_DEFERRED",
            BillingEventType::ScheduleCreated => "SCHEDULE_CREATED",
            BillingEventType::ScheduleFailed => "SCHEDULE_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// Builder for billing events
pub struct BillingEventBuilder {
    event_type: BillingEventType,
    user_id: Option<Uuid>,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            event_type,
            user_id: None,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a billing event. Callers treat failures as warnings; the audit
    /// trail never blocks reconciliation.
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id, event_type, event_data,
                stripe_event_id, stripe_subscription_id, stripe_customer_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.stripe_customer_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }
}
