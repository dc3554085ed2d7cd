//! Promotional subscription schedules
//!
//! The discounted-first-period offer bills the intro price for exactly one
//! cycle, then the standard price indefinitely. That split is expressed as a
//! two-phase subscription schedule at Stripe: phase one runs for one
//! iteration of the intro price (the cycle length is implied by the price's
//! own recurrence; an explicit end date would duplicate Stripe's billing
//! math and drift from it), phase two has no iteration bound.

use stripe::{
    SubscriptionSchedule, SubscriptionScheduleEndBehavior, UpdateSubscriptionSchedule,
    UpdateSubscriptionSchedulePhases, UpdateSubscriptionSchedulePhasesItems,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Seam between webhook handling and schedule creation.
///
/// The live implementation talks to Stripe; substituting one that fails
/// lets the checkout path's failure isolation be exercised without a
/// network round trip.
pub trait SubscriptionScheduler: Send + Sync {
    fn split_first_period(
        &self,
        subscription_id: &str,
        intro_price_id: &str,
        recurring_price_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<String>> + Send;
}

pub struct ScheduleBuilder {
    stripe: StripeClient,
}

impl ScheduleBuilder {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Convert a just-created subscription into a two-phase schedule.
    ///
    /// Best-effort by contract: the caller logs a failure and carries on.
    /// A missing schedule means the customer may be billed the intro price
    /// again next cycle, which is a billing-side remediation concern, not a
    /// reason to withhold access that was paid for.
    pub async fn split_first_period(
        &self,
        subscription_id: &str,
        intro_price_id: &str,
        recurring_price_id: &str,
    ) -> BillingResult<String> {
        let parsed_sub_id: stripe::SubscriptionId = subscription_id
            .parse()
            .map_err(|e| BillingError::ScheduleFailed(format!("Invalid subscription ID: {}", e)))?;

        // Attach a schedule to the live subscription, then rewrite its phases
        let schedule = SubscriptionSchedule::create(
            self.stripe.inner(),
            stripe::CreateSubscriptionSchedule {
                from_subscription: Some(parsed_sub_id.as_str()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| BillingError::ScheduleFailed(e.to_string()))?;

        let phases = vec![
            UpdateSubscriptionSchedulePhases {
                items: vec![UpdateSubscriptionSchedulePhasesItems {
                    price: Some(intro_price_id.to_string()),
                    quantity: Some(1),
                    ..Default::default()
                }],
                iterations: Some(1),
                ..Default::default()
            },
            // No iteration bound: the standard price continues indefinitely
            UpdateSubscriptionSchedulePhases {
                items: vec![UpdateSubscriptionSchedulePhasesItems {
                    price: Some(recurring_price_id.to_string()),
                    quantity: Some(1),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ];

        let updated = SubscriptionSchedule::update(
            self.stripe.inner(),
            &schedule.id,
            UpdateSubscriptionSchedule {
                phases: Some(phases),
                end_behavior: Some(SubscriptionScheduleEndBehavior::Release),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| BillingError::ScheduleFailed(e.to_string()))?;

        tracing::info!(
            subscription_id = %subscription_id,
            schedule_id = %updated.id,
            intro_price_id = %intro_price_id,
            recurring_price_id = %recurring_price_id,
            "Created two-phase promotional schedule"
        );

        Ok(updated.id.to_string())
    }
}

impl SubscriptionScheduler for ScheduleBuilder {
    fn split_first_period(
        &self,
        subscription_id: &str,
        intro_price_id: &str,
        recurring_price_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<String>> + Send {
        // Inherent method resolution keeps this from recursing
        ScheduleBuilder::split_first_period(self, subscription_id, intro_price_id, recurring_price_id)
    }
}
