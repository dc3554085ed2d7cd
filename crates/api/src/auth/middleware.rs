//! Authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use reelgate_shared::UserRole;
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// Shared state for auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub jwt: JwtManager,
}

/// The authenticated caller, inserted as a request extension
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        UserRole::parse(&self.role)
            .map(|r| r.is_admin())
            .unwrap_or(false)
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Require a valid access token; rejects the request otherwise
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req).ok_or(ApiError::Unauthorized)?;

    let claims = auth.jwt.validate_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Token validation failed");
        ApiError::InvalidToken
    })?;

    req.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        email: claims.email,
        role: claims.role,
    });

    Ok(next.run(req).await)
}

/// Attach the caller's identity when a valid token is present, but let the
/// request through either way. Anonymous checkout depends on this.
pub async fn optional_auth(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(&req) {
        if let Ok(claims) = auth.jwt.validate_token(token) {
            req.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                email: claims.email,
                role: claims.role,
            });
        }
    }
    next.run(req).await
}
