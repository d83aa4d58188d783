use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::token;
use crate::error::ApiError;
use crate::pipeline::user;
use crate::store::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub code: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub jwt: String,
    pub user_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/login/github", post(github_login))
}

/// Exchange an OAuth code for an API JWT, creating or refreshing the user
/// record along the way.
#[tracing::instrument(skip(state, body), err)]
async fn github_login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let authenticated = state
        .scm
        .exchange_code(&body.code, &body.state)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    let user = user::upsert_login(&state, state.scm.name(), &authenticated)
        .await
        .map_err(ApiError::from)?;

    let jwt = token::issue_login_token(&state.config.jwt_secret, &user.id, &user.user)
        .map_err(|e| ApiError::Internal(e.into()))?;

    tracing::info!(login = %user.user, "login successful");
    Ok(Json(LoginResponse {
        jwt,
        user_id: user.id,
    }))
}
