// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Reelgate Billing Module
//!
//! Stripe integration for the subscription entitlement core.
//!
//! ## Features
//!
//! - **Checkout**: Create subscription checkout sessions, including the
//!   discounted-first-period promotional offer
//! - **Webhooks**: Verify and reconcile Stripe lifecycle events
//! - **Reconciliation**: Idempotent entitlement upserts, replay-safe
//! - **Linkage**: Resolve checkouts to local users, with a synchronous
//!   link path for buyers who pay before creating an account
//! - **Schedules**: Two-phase subscription schedules for promotional pricing
//! - **Simulation**: Synthetic events in non-production environments

pub mod checkout;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod identity;
pub mod linkage;
pub mod reconcile;
pub mod schedule;
pub mod simulator;
pub mod webhooks;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{Environment, PriceIds, StripeClient, StripeConfig};

// Entitlements
pub use entitlement::{
    BillingInterval, EntitlementRecord, EntitlementStore, SubscriptionSnapshot, SubscriptionStatus,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Identity
pub use identity::UserDirectory;

// Linkage
pub use linkage::{CheckoutLinkage, LinkageResolver, ANONYMOUS_REF};

// Reconciliation
pub use reconcile::ReconciliationService;

// Schedules
pub use schedule::{ScheduleBuilder, SubscriptionScheduler};

// Simulation
pub use simulator::{EventSimulator, SimulatedEvent, SimulationResult};

// Webhooks
pub use webhooks::{verify_signature, WebhookHandler};
