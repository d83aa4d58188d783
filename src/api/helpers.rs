use std::sync::Arc;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::pipeline::registry::{self, Pipeline};
use crate::pipeline::user;
use crate::scm::SourceHost;
use crate::store::AppState;

pub async fn find_pipeline(
    state: &AppState,
    owner: &str,
    repo: &str,
) -> Result<Pipeline, ApiError> {
    registry::find(state, owner, repo).await.map_err(Into::into)
}

/// Hook identities only reach the repo their token names.
pub fn authorize(auth: &AuthUser, owner: &str, repo: &str) -> Result<(), ApiError> {
    if !auth.authorizes_pipeline(owner, repo) {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// Source-host client scoped to the pipeline's registered user.
///
/// Webhook-triggered work runs with the stored token of the user who created
/// the pipeline, not with the caller's credentials.
pub async fn pipeline_client(
    state: &AppState,
    pipeline: &Pipeline,
) -> Result<Arc<dyn SourceHost>, ApiError> {
    let user = user::find_by_login(state, &pipeline.source, &pipeline.login)
        .await
        .map_err(|_| {
            ApiError::BadRequest(format!(
                "user {} not found, cannot access remote source",
                pipeline.login
            ))
        })?;
    let token = user.token_for(&pipeline.source).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "user {} has no {} credentials",
            pipeline.login, pipeline.source
        ))
    })?;
    Ok(state.scm.client(token))
}

/// Source-host client scoped to the authenticated caller.
pub async fn caller_client(
    state: &AppState,
    auth: &AuthUser,
) -> Result<Arc<dyn SourceHost>, ApiError> {
    let user_id = auth.user_id().ok_or(ApiError::Unauthorized)?;
    let user = user::get(state, user_id).await.map_err(ApiError::from)?;
    let token = user
        .token_for(state.scm.name())
        .ok_or_else(|| ApiError::BadRequest("no source-host credentials on record".into()))?;
    Ok(state.scm.client(token))
}
