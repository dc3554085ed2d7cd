//! Reconciliation integration tests
//!
//! Run against a real Postgres with migrations applied:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/reelgate_test cargo test -p reelgate-billing -- --ignored
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use reelgate_billing::{
    BillingInterval, CheckoutLinkage, EntitlementStore, LinkageResolver, ReconciliationService,
    SubscriptionSnapshot, SubscriptionStatus, UserDirectory,
};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ignored tests");
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("Failed to connect to test database")
}

async fn create_user(pool: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, display_name) VALUES ($1, $2, 'Test User')")
        .bind(id)
        .bind(format!("test+{}@example.com", id.simple()))
        .execute(pool)
        .await
        .unwrap();
    id
}

fn snapshot(subscription_id: &str, customer_id: &str) -> SubscriptionSnapshot {
    let now = OffsetDateTime::now_utc();
    SubscriptionSnapshot {
        subscription_id: subscription_id.to_string(),
        customer_id: customer_id.to_string(),
        price_id: Some("price_test_monthly".to_string()),
        interval: BillingInterval::Monthly,
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: now + Duration::days(30),
        cancel_at_period_end: false,
        canceled_at: None,
        trial_start: None,
        trial_end: None,
        is_promotional: false,
    }
}

fn unique_sub() -> (String, String) {
    let tag = Uuid::new_v4().simple().to_string();
    (format!("sub_test_{}", tag), format!("cus_test_{}", tag))
}

#[tokio::test]
#[ignore]
async fn replayed_checkout_converges_to_one_row() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();
    let snap = snapshot(&sub, &cus);

    let first = store.upsert(user_id, &snap).await.unwrap();
    let second = store.upsert(user_id, &snap).await.unwrap();

    assert_eq!(first.id, second.id);
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entitlements WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

#[tokio::test]
#[ignore]
async fn second_checkout_replaces_in_place() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;

    let (sub_a, cus_a) = unique_sub();
    let first = store.upsert(user_id, &snapshot(&sub_a, &cus_a)).await.unwrap();

    // Fresh checkout after churn: new subscription, same user
    let (sub_b, cus_b) = unique_sub();
    let mut renewed = snapshot(&sub_b, &cus_b);
    renewed.current_period_end = OffsetDateTime::now_utc() + Duration::days(5);
    let second = store.upsert(user_id, &renewed).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.stripe_subscription_id.as_deref(), Some(sub_b.as_str()));
    // The monotonic guard resets across subscription ids, so the shorter
    // period of the new subscription wins
    assert!(second.current_period_end < first.current_period_end);
}

#[tokio::test]
#[ignore]
async fn stale_update_does_not_regress_period_end() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();

    let mut renewal = snapshot(&sub, &cus);
    renewal.current_period_end = OffsetDateTime::now_utc() + Duration::days(60);
    store.upsert(user_id, &renewal).await.unwrap();

    // A delayed event from the previous cycle arrives afterwards
    let mut stale = snapshot(&sub, &cus);
    stale.current_period_end = OffsetDateTime::now_utc() + Duration::days(30);
    let user = store.apply_update(&stale).await.unwrap();
    assert_eq!(user, Some(user_id));

    let record = store.find_by_user(user_id).await.unwrap().unwrap();
    assert!(record.current_period_end > OffsetDateTime::now_utc() + Duration::days(59));
}

#[tokio::test]
#[ignore]
async fn cancellation_overrides_the_monotonic_guard() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();

    let mut long = snapshot(&sub, &cus);
    long.current_period_end = OffsetDateTime::now_utc() + Duration::days(60);
    store.upsert(user_id, &long).await.unwrap();

    let mut canceled = snapshot(&sub, &cus);
    canceled.status = SubscriptionStatus::Canceled;
    canceled.current_period_end = OffsetDateTime::now_utc() + Duration::days(1);
    store.apply_update(&canceled).await.unwrap();

    let record = store.find_by_user(user_id).await.unwrap().unwrap();
    assert_eq!(record.status, "canceled");
    assert!(record.current_period_end < OffsetDateTime::now_utc() + Duration::days(2));
    assert!(!record.grants_access());
}

#[tokio::test]
#[ignore]
async fn deletion_is_idempotent_and_stamps_canceled_at_once() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();
    store.upsert(user_id, &snapshot(&sub, &cus)).await.unwrap();

    assert_eq!(store.mark_canceled(&sub).await.unwrap(), Some(user_id));
    let first = store.find_by_user(user_id).await.unwrap().unwrap();
    let stamped = first.canceled_at.unwrap();

    // Replay
    assert_eq!(store.mark_canceled(&sub).await.unwrap(), Some(user_id));
    let second = store.find_by_user(user_id).await.unwrap().unwrap();
    assert_eq!(second.canceled_at, Some(stamped));
    assert_eq!(second.status, "canceled");
}

#[tokio::test]
#[ignore]
async fn updates_for_unknown_customers_are_noops() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let (sub, cus) = unique_sub();

    assert_eq!(store.apply_update(&snapshot(&sub, &cus)).await.unwrap(), None);
    assert_eq!(store.mark_canceled(&sub).await.unwrap(), None);
    assert_eq!(store.mark_past_due(&cus).await.unwrap(), None);
}

#[tokio::test]
#[ignore]
async fn invoice_failure_marks_past_due_without_touching_period() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();
    let original = store.upsert(user_id, &snapshot(&sub, &cus)).await.unwrap();

    assert_eq!(store.mark_past_due(&cus).await.unwrap(), Some(user_id));
    let record = store.find_by_user(user_id).await.unwrap().unwrap();
    assert_eq!(record.status, "past_due");
    assert_eq!(record.current_period_end, original.current_period_end);
    assert!(!record.grants_access());
}

#[tokio::test]
#[ignore]
async fn promotional_flag_persists_independent_of_scheduling() {
    let pool = test_pool().await;
    let store = EntitlementStore::new(pool.clone());
    let user_id = create_user(&pool).await;
    let (sub, cus) = unique_sub();

    // The schedule builder is best-effort; the flag rides on the snapshot
    // and must land whether or not a schedule was ever created
    let mut snap = snapshot(&sub, &cus);
    snap.is_promotional = true;
    let record = store.upsert(user_id, &snap).await.unwrap();

    assert!(record.is_promotional);
    assert!(record.grants_access());
}

#[tokio::test]
#[ignore]
async fn deferred_linkage_acks_without_creating_a_record() {
    let pool = test_pool().await;
    let reconciliation = ReconciliationService::new(pool.clone());
    let (sub, cus) = unique_sub();
    let event_id = format!("evt_test_{}", Uuid::new_v4().simple());

    // A paid checkout with no resolvable user is acknowledged, not retried
    reconciliation
        .record_linkage_deferred(&snapshot(&sub, &cus), &event_id)
        .await
        .unwrap();

    // No entitlement row exists for the unresolved customer
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM entitlements WHERE stripe_customer_id = $1")
            .bind(&cus)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count.0, 0);

    // The deferral is on the audit trail for the later link path
    let deferred: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM billing_events \
         WHERE stripe_customer_id = $1 AND event_type = 'LINKAGE_DEFERRED'",
    )
    .bind(&cus)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(deferred.0, 1);
}

#[tokio::test]
#[ignore]
async fn linkage_resolves_via_email_fallback() {
    let pool = test_pool().await;
    let user_id = create_user(&pool).await;
    let email: (String,) = sqlx::query_as("SELECT email FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();

    let resolver = LinkageResolver::new(UserDirectory::new(pool.clone()));

    // No direct reference; the email is the only signal
    let linkage = CheckoutLinkage {
        client_reference_id: Some("anonymous".to_string()),
        metadata_user_id: None,
        customer_email: Some(email.0),
    };
    assert_eq!(resolver.resolve(&linkage).await.unwrap(), Some(user_id));

    // A reference to a deleted account is ignored, and with no other signal
    // the resolution is a miss, not an error
    let dangling = CheckoutLinkage {
        client_reference_id: Some(Uuid::new_v4().to_string()),
        metadata_user_id: None,
        customer_email: Some("nobody@example.com".to_string()),
    };
    assert_eq!(resolver.resolve(&dangling).await.unwrap(), None);
}
