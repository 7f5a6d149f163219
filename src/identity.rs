//! Identity directory: resolves opaque credentials to user identities.
//!
//! Credential issuance is not part of this service. The directory is a narrow
//! trait so a deployment can back it with an external identity provider; the
//! bundled implementation reads the `users` table.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::debug;

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::model::{Identity, Role};
use crate::storage::Storage;

/// Resolves credentials and user ids to identities.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolve a bearer credential. Unknown credentials are `Unauthorized`.
    async fn resolve(&self, credential: &str) -> AppResult<Identity>;

    /// Fetch the current identity of a user id, if the user exists.
    async fn lookup(&self, user_id: &str) -> AppResult<Option<Identity>>;
}

/// Shared handle to a directory implementation.
pub type Directory = Arc<dyn IdentityDirectory>;

#[async_trait]
impl IdentityDirectory for Storage {
    async fn resolve(&self, credential: &str) -> AppResult<Identity> {
        self.user_by_credential(credential)
            .await?
            .map(|user| user.identity())
            .ok_or_else(|| AppError::unauthorized("Invalid token"))
    }

    async fn lookup(&self, user_id: &str) -> AppResult<Option<Identity>> {
        Ok(self.get_user(user_id).await?.map(|user| user.identity()))
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The authenticated caller of an HTTP request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl AuthUser {
    /// Fail with `Forbidden` unless the caller is an administrator.
    pub fn require_admin(&self) -> AppResult<()> {
        if self.0.role == Role::Admin {
            Ok(())
        } else {
            Err(AppError::forbidden("Administrator role required"))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("No token provided"))?;

        let token = bearer_token(header).ok_or_else(|| AppError::unauthorized("No token provided"))?;

        let identity = state.directory.resolve(token).await.inspect_err(|_| {
            debug!(path = %parts.uri.path(), "Rejected request with invalid token");
        })?;

        Ok(AuthUser(identity))
    }
}
