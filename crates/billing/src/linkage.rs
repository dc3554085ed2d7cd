//! Mapping checkout events to local users
//!
//! A checkout can arrive before the buyer has an account, after, or under a
//! different email than they will sign up with. Resolution follows a strict
//! precedence chain and never guesses: explicit client reference, then
//! checkout metadata, then exact email match. A total miss is `None`, not an
//! error; the synchronous link path picks those up later.

use uuid::Uuid;

use crate::error::BillingResult;
use crate::identity::UserDirectory;

/// Sentinel the checkout flow writes when no user was logged in.
pub const ANONYMOUS_REF: &str = "anonymous";

/// The linkage-relevant fields of a checkout session.
#[derive(Debug, Clone, Default)]
pub struct CheckoutLinkage {
    /// `client_reference_id` set at session creation (strongest signal)
    pub client_reference_id: Option<String>,
    /// `metadata["user_id"]`, used by flows started before account creation
    pub metadata_user_id: Option<String>,
    /// Email captured by the checkout form
    pub customer_email: Option<String>,
}

impl CheckoutLinkage {
    pub fn from_session(session: &stripe::CheckoutSession) -> Self {
        Self {
            client_reference_id: session.client_reference_id.clone(),
            metadata_user_id: session
                .metadata
                .as_ref()
                .and_then(|m| m.get("user_id"))
                .cloned(),
            customer_email: session
                .customer_details
                .as_ref()
                .and_then(|d| d.email.clone()),
        }
    }

    /// The user id carried directly on the session, honoring precedence.
    ///
    /// Pure: no lookups. An `anonymous` sentinel or an unparseable value in
    /// a field disqualifies that field and falls through to the next.
    pub fn preferred_reference(&self) -> Option<Uuid> {
        [&self.client_reference_id, &self.metadata_user_id]
            .into_iter()
            .flatten()
            .filter(|r| r.as_str() != ANONYMOUS_REF)
            .find_map(|r| Uuid::parse_str(r).ok())
    }
}

/// Resolves checkout sessions to local user ids.
#[derive(Clone)]
pub struct LinkageResolver {
    users: UserDirectory,
}

impl LinkageResolver {
    pub fn new(users: UserDirectory) -> Self {
        Self { users }
    }

    /// Resolve a checkout to a user id, or `None` when nothing matches.
    pub async fn resolve(&self, linkage: &CheckoutLinkage) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = linkage.preferred_reference() {
            // Direct references can outlive the account they point at
            if self.users.find_by_id(user_id).await?.is_some() {
                return Ok(Some(user_id));
            }
            tracing::warn!(
                user_id = %user_id,
                "Checkout carried a user reference with no matching account"
            );
        }

        if let Some(email) = linkage.customer_email.as_deref() {
            if let Some(user) = self.users.find_by_email(email).await? {
                tracing::info!(
                    user_id = %user.id,
                    "Resolved checkout to user via email fallback"
                );
                return Ok(Some(user.id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_client_reference_wins_over_metadata() {
        let a = uid();
        let b = uid();
        let linkage = CheckoutLinkage {
            client_reference_id: Some(a.to_string()),
            metadata_user_id: Some(b.to_string()),
            customer_email: Some("someone@example.com".to_string()),
        };
        assert_eq!(linkage.preferred_reference(), Some(a));
    }

    #[test]
    fn test_metadata_used_when_reference_unset() {
        let b = uid();
        let linkage = CheckoutLinkage {
            client_reference_id: None,
            metadata_user_id: Some(b.to_string()),
            customer_email: None,
        };
        assert_eq!(linkage.preferred_reference(), Some(b));
    }

    #[test]
    fn test_anonymous_sentinel_falls_through() {
        let b = uid();
        let linkage = CheckoutLinkage {
            client_reference_id: Some(ANONYMOUS_REF.to_string()),
            metadata_user_id: Some(b.to_string()),
            customer_email: None,
        };
        assert_eq!(linkage.preferred_reference(), Some(b));

        let fully_anonymous = CheckoutLinkage {
            client_reference_id: Some(ANONYMOUS_REF.to_string()),
            metadata_user_id: None,
            customer_email: Some("someone@example.com".to_string()),
        };
        assert_eq!(fully_anonymous.preferred_reference(), None);
    }

    #[test]
    fn test_garbage_reference_falls_through() {
        let b = uid();
        let linkage = CheckoutLinkage {
            client_reference_id: Some("not-a-uuid".to_string()),
            metadata_user_id: Some(b.to_string()),
            customer_email: None,
        };
        assert_eq!(linkage.preferred_reference(), Some(b));
    }

    #[test]
    fn test_empty_linkage_has_no_reference() {
        assert_eq!(CheckoutLinkage::default().preferred_reference(), None);
    }
}
