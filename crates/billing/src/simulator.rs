//! Synthetic billing events for non-production environments
//!
//! Exercises the reconciliation engine end to end without a Stripe account.
//! The simulator only constructs in non-production environments; production
//! binaries simply never get one, so there is no flag to misconfigure.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::entitlement::{BillingInterval, EntitlementRecord, SubscriptionSnapshot, SubscriptionStatus};
use crate::error::BillingResult;
use crate::reconcile::ReconciliationService;

/// A synthetic event to feed through reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulatedEvent {
    CheckoutCompleted {
        user_id: Uuid,
        #[serde(default)]
        interval: BillingInterval,
        #[serde(default)]
        promotional: bool,
    },
    SubscriptionUpdated {
        customer_id: String,
        subscription_id: String,
        status: SubscriptionStatus,
        #[serde(default)]
        cancel_at_period_end: bool,
    },
    SubscriptionDeleted {
        subscription_id: String,
    },
    InvoicePaymentFailed {
        customer_id: String,
    },
}

/// Outcome of a simulated event, echoing the ids the snapshot was given
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    pub event_id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub entitlement: Option<EntitlementRecord>,
}

pub struct EventSimulator {
    reconciliation: ReconciliationService,
    monthly_price_id: String,
    annual_price_id: Option<String>,
}

impl EventSimulator {
    /// Construct a simulator, or `None` in production.
    pub fn new(config: &StripeConfig, reconciliation: ReconciliationService) -> Option<Self> {
        if config.environment.is_production() {
            return None;
        }
        tracing::warn!("Billing event simulator enabled; this must never appear in production");
        Some(Self {
            reconciliation,
            monthly_price_id: config.price_ids.monthly.clone(),
            annual_price_id: config.price_ids.annual.clone(),
        })
    }

    /// Run a synthetic event through the same reconciliation paths real
    /// webhook events take.
    pub async fn dispatch(&self, event: SimulatedEvent) -> BillingResult<SimulationResult> {
        let event_id = format!("evt_sim_{}", Uuid::new_v4().simple());

        match event {
            SimulatedEvent::CheckoutCompleted {
                user_id,
                interval,
                promotional,
            } => {
                let snapshot = self.synthesize_snapshot(interval, promotional);
                let record = self
                    .reconciliation
                    .record_checkout(
                        user_id,
                        &snapshot,
                        crate::events::ActorType::System,
                        Some(&event_id),
                    )
                    .await?;
                Ok(SimulationResult {
                    event_id,
                    subscription_id: Some(snapshot.subscription_id),
                    customer_id: Some(snapshot.customer_id),
                    entitlement: Some(record),
                })
            }
            SimulatedEvent::SubscriptionUpdated {
                customer_id,
                subscription_id,
                status,
                cancel_at_period_end,
            } => {
                let mut snapshot = self.synthesize_snapshot(BillingInterval::Monthly, false);
                snapshot.customer_id = customer_id.clone();
                snapshot.subscription_id = subscription_id.clone();
                snapshot.status = status;
                snapshot.cancel_at_period_end = cancel_at_period_end;
                self.reconciliation
                    .apply_subscription_update(&snapshot, &event_id)
                    .await?;
                Ok(SimulationResult {
                    event_id,
                    subscription_id: Some(subscription_id),
                    customer_id: Some(customer_id),
                    entitlement: None,
                })
            }
            SimulatedEvent::SubscriptionDeleted { subscription_id } => {
                self.reconciliation
                    .apply_subscription_deleted(&subscription_id, &event_id)
                    .await?;
                Ok(SimulationResult {
                    event_id,
                    subscription_id: Some(subscription_id),
                    customer_id: None,
                    entitlement: None,
                })
            }
            SimulatedEvent::InvoicePaymentFailed { customer_id } => {
                self.reconciliation
                    .apply_invoice_failed(&customer_id, &event_id)
                    .await?;
                Ok(SimulationResult {
                    event_id,
                    subscription_id: None,
                    customer_id: Some(customer_id),
                    entitlement: None,
                })
            }
        }
    }

    fn synthesize_snapshot(
        &self,
        interval: BillingInterval,
        promotional: bool,
    ) -> SubscriptionSnapshot {
        let now = OffsetDateTime::now_utc();
        let period = match interval {
            BillingInterval::Monthly => Duration::days(30),
            BillingInterval::Annual => Duration::days(365),
        };
        let price_id = match interval {
            BillingInterval::Monthly => Some(self.monthly_price_id.clone()),
            BillingInterval::Annual => self.annual_price_id.clone(),
        };

        SubscriptionSnapshot {
            subscription_id: format!("sub_sim_{}", Uuid::new_v4().simple()),
            customer_id: format!("cus_sim_{}", Uuid::new_v4().simple()),
            price_id,
            interval,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + period,
            cancel_at_period_end: false,
            canceled_at: None,
            trial_start: None,
            trial_end: None,
            is_promotional: promotional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Environment;

    fn config(environment: Environment) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_ids: crate::client::PriceIds {
                monthly: "price_monthly".to_string(),
                annual: None,
                intro_monthly: None,
            },
            app_base_url: "http://localhost:3000".to_string(),
            environment,
        }
    }

    #[test]
    fn test_simulated_event_deserializes() {
        let event: SimulatedEvent = serde_json::from_str(
            r#"{"type":"checkout_completed","user_id":"a6e2b3a0-9d7e-4a39-8a25-1f1df4a0f1aa"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            SimulatedEvent::CheckoutCompleted {
                interval: BillingInterval::Monthly,
                promotional: false,
                ..
            }
        ));
    }

    fn lazy_reconciliation() -> ReconciliationService {
        // connect_lazy never opens a connection; good enough to construct
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/reelgate_unused")
            .unwrap();
        ReconciliationService::new(pool)
    }

    #[tokio::test]
    async fn test_simulator_refuses_production() {
        assert!(EventSimulator::new(&config(Environment::Production), lazy_reconciliation()).is_none());
        assert!(EventSimulator::new(&config(Environment::Development), lazy_reconciliation()).is_some());
    }
}
