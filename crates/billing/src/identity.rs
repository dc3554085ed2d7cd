//! Read-only access to user accounts
//!
//! Accounts are owned by the identity provider; billing only ever looks
//! them up by id or by exact email match.

use reelgate_shared::User;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Clone)]
pub struct UserDirectory {
    pool: PgPool,
}

impl UserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let user = sqlx::query_as(
            "SELECT id, email, display_name, role, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Exact-match email lookup. Email is unique in the identity store, so
    /// at most one row comes back.
    pub async fn find_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let user = sqlx::query_as(
            "SELECT id, email, display_name, role, created_at, updated_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }
}
