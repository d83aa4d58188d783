use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::auth::token;
use crate::error::ApiError;
use crate::store::AppState;

/// Who is calling: a logged-in user, or a hook token scoped to one repo
/// (webhook deliveries and in-cluster workload agents).
#[derive(Debug, Clone)]
pub enum Identity {
    User { user_id: String, login: String },
    Hook { owner: String, repo: String },
}

/// Authenticated caller extracted from `Authorization: Bearer <JWT>` or the
/// `id_token` query parameter.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub identity: Identity,
}

impl AuthUser {
    /// Hook identities only reach the repo their claims name.
    pub fn authorizes_pipeline(&self, owner: &str, repo: &str) -> bool {
        match &self.identity {
            Identity::User { .. } => true,
            Identity::Hook { owner: o, repo: r } => o == owner && r == repo,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.identity {
            Identity::User { user_id, .. } => Some(user_id),
            Identity::Hook { .. } => None,
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = extract_bearer_token(parts)
            .or_else(|| extract_id_token(parts))
            .ok_or(ApiError::Unauthorized)?;

        let secret = &state.config.jwt_secret;

        if let Ok(claims) = token::verify_login_token(secret, &raw) {
            return Ok(Self {
                identity: Identity::User {
                    user_id: claims.sub,
                    login: claims.login,
                },
            });
        }

        if let Ok(claims) = token::verify_hook_token(secret, &raw) {
            return Ok(Self {
                identity: Identity::Hook {
                    owner: claims.owner,
                    repo: claims.repo,
                },
            });
        }

        Err(ApiError::Unauthorized)
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

fn extract_id_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "id_token")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}
