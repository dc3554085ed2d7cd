//! Entitlement records and the store that owns them
//!
//! One row per user decides access to paid content. Every write path
//! (webhook reconciliation, synchronous linkage) funnels into the same
//! atomic upsert keyed on `user_id`, so replayed or racing events converge
//! to a single record. Rows are never deleted; cancellation is a status
//! transition.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Local subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }

    /// Map a Stripe subscription status onto the local enum.
    ///
    /// Stripe has more states than we track; everything that doesn't grant
    /// or suspend access folds into `inactive`.
    pub fn from_stripe(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Unpaid
            | stripe::SubscriptionStatus::Incomplete
            | stripe::SubscriptionStatus::IncompleteExpired
            | stripe::SubscriptionStatus::Paused => SubscriptionStatus::Inactive,
        }
    }

    /// Whether this status grants access to paid content
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Trialing | SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Annual,
}

impl BillingInterval {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "annual" | "yearly" | "year" => Some(Self::Annual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }

    fn from_recurring(interval: stripe::RecurringInterval) -> Self {
        match interval {
            stripe::RecurringInterval::Year => BillingInterval::Annual,
            _ => BillingInterval::Monthly,
        }
    }
}

/// The persisted entitlement record, one per user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntitlementRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub billing_interval: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub is_promotional: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl EntitlementRecord {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::parse(&self.status).unwrap_or(SubscriptionStatus::Inactive)
    }

    pub fn grants_access(&self) -> bool {
        self.status().grants_access()
    }
}

/// Normalized view of a provider subscription.
///
/// Built from a verified Stripe subscription for real events, or synthesized
/// by the event simulator in non-production environments. The reconciliation
/// engine only ever sees this shape.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub is_promotional: bool,
}

fn timestamp(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

impl SubscriptionSnapshot {
    /// Normalize a canonical Stripe subscription object.
    pub fn from_stripe(subscription: &stripe::Subscription, is_promotional: bool) -> Self {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let first_price = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref());

        let price_id = first_price.map(|p| p.id.to_string());
        let interval = first_price
            .and_then(|p| p.recurring.as_ref())
            .map(|r| BillingInterval::from_recurring(r.interval))
            .unwrap_or_default();

        Self {
            subscription_id: subscription.id.to_string(),
            customer_id,
            price_id,
            interval,
            status: SubscriptionStatus::from_stripe(subscription.status),
            current_period_start: timestamp(subscription.current_period_start),
            current_period_end: timestamp(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at.map(timestamp),
            trial_start: subscription.trial_start.map(timestamp),
            trial_end: subscription.trial_end.map(timestamp),
            is_promotional,
        }
    }
}

/// Store for entitlement records.
///
/// Atomicity lives in the database: the upsert is a single
/// `INSERT ... ON CONFLICT (user_id) DO UPDATE`, so concurrent webhook and
/// synchronous-link invocations for the same user cannot produce duplicates
/// regardless of how many service instances share the pool.
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the entitlement for a user from a subscription snapshot.
    ///
    /// `current_period_end` never moves backwards for the same subscription
    /// id unless the incoming status is `canceled`; replaying a stale update
    /// after a newer one leaves the newer period end in place. A different
    /// subscription id (fresh checkout after cancellation) resets the guard.
    pub async fn upsert(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
    ) -> BillingResult<EntitlementRecord> {
        if snapshot.customer_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "subscription snapshot has no customer id".to_string(),
            ));
        }

        let record: EntitlementRecord = sqlx::query_as(
            r#"
            INSERT INTO entitlements (
                id, user_id, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                billing_interval, status, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, trial_start, trial_end, is_promotional,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW()
            )
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                billing_interval = EXCLUDED.billing_interval,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = CASE
                    WHEN EXCLUDED.status = 'canceled'
                      OR entitlements.stripe_subscription_id IS DISTINCT FROM EXCLUDED.stripe_subscription_id
                    THEN EXCLUDED.current_period_end
                    ELSE GREATEST(entitlements.current_period_end, EXCLUDED.current_period_end)
                END,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                is_promotional = EXCLUDED.is_promotional,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&snapshot.customer_id)
        .bind(&snapshot.subscription_id)
        .bind(&snapshot.price_id)
        .bind(snapshot.interval.as_str())
        .bind(snapshot.status.as_str())
        .bind(snapshot.current_period_start)
        .bind(snapshot.current_period_end)
        .bind(snapshot.cancel_at_period_end)
        .bind(snapshot.canceled_at)
        .bind(snapshot.trial_start)
        .bind(snapshot.trial_end)
        .bind(snapshot.is_promotional)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>> {
        let record = sqlx::query_as("SELECT * FROM entitlements WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn find_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let record = sqlx::query_as("SELECT * FROM entitlements WHERE stripe_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let record = sqlx::query_as("SELECT * FROM entitlements WHERE stripe_subscription_id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Apply a subscription update, keyed by customer id.
    ///
    /// Returns the affected user id, or `None` when no entitlement is linked
    /// to that customer yet (linkage never completed).
    pub async fn apply_update(
        &self,
        snapshot: &SubscriptionSnapshot,
    ) -> BillingResult<Option<Uuid>> {
        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE entitlements SET
                stripe_subscription_id = $2,
                stripe_price_id = $3,
                billing_interval = $4,
                status = $5,
                current_period_start = $6,
                current_period_end = CASE
                    WHEN $5 = 'canceled'
                      OR stripe_subscription_id IS DISTINCT FROM $2
                    THEN $7
                    ELSE GREATEST(current_period_end, $7)
                END,
                cancel_at_period_end = $8,
                canceled_at = $9,
                trial_start = $10,
                trial_end = $11,
                updated_at = NOW()
            WHERE stripe_customer_id = $1
            RETURNING user_id
            "#,
        )
        .bind(&snapshot.customer_id)
        .bind(&snapshot.subscription_id)
        .bind(&snapshot.price_id)
        .bind(snapshot.interval.as_str())
        .bind(snapshot.status.as_str())
        .bind(snapshot.current_period_start)
        .bind(snapshot.current_period_end)
        .bind(snapshot.cancel_at_period_end)
        .bind(snapshot.canceled_at)
        .bind(snapshot.trial_start)
        .bind(snapshot.trial_end)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated.map(|(user_id,)| user_id))
    }

    /// Mark the subscription canceled. Idempotent: the first application
    /// stamps `canceled_at`, later replays leave it untouched.
    pub async fn mark_canceled(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE entitlements
            SET status = 'canceled',
                canceled_at = COALESCE(canceled_at, NOW()),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated.map(|(user_id,)| user_id))
    }

    /// Mark the customer's entitlement past due. Period bounds untouched.
    pub async fn mark_past_due(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE entitlements
            SET status = 'past_due', updated_at = NOW()
            WHERE stripe_customer_id = $1
            RETURNING user_id
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(updated.map(|(user_id,)| user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Inactive,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::parse("unpaid"), None);
    }

    #[test]
    fn test_status_from_stripe_folds_unknown_states() {
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Incomplete),
            SubscriptionStatus::Inactive
        );
        assert_eq!(
            SubscriptionStatus::from_stripe(stripe::SubscriptionStatus::Paused),
            SubscriptionStatus::Inactive
        );
    }

    #[test]
    fn test_access_gating() {
        assert!(SubscriptionStatus::Active.grants_access());
        assert!(SubscriptionStatus::Trialing.grants_access());
        assert!(!SubscriptionStatus::PastDue.grants_access());
        assert!(!SubscriptionStatus::Canceled.grants_access());
        assert!(!SubscriptionStatus::Inactive.grants_access());
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(BillingInterval::from_str("monthly"), Some(BillingInterval::Monthly));
        assert_eq!(BillingInterval::from_str("Year"), Some(BillingInterval::Annual));
        assert_eq!(BillingInterval::from_str("weekly"), None);
        assert_eq!(BillingInterval::Annual.as_str(), "annual");
    }
}
