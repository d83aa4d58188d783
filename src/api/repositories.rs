use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::scm::Repository;
use crate::store::AppState;

use super::helpers;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/repositories", get(list_repositories))
        .route("/api/v1/repositories/{owner}/{name}", get(get_repository))
}

/// Repositories the authenticated user can reach on the source host.
async fn list_repositories(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Repository>>, ApiError> {
    let scm = helpers::caller_client(&state, &auth).await?;
    let repos = scm.list_repositories().await.map_err(ApiError::from)?;
    Ok(Json(repos))
}

async fn get_repository(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Repository>, ApiError> {
    let scm = helpers::caller_client(&state, &auth).await?;
    let repo = scm
        .get_repository(&owner, &name)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(repo))
}
