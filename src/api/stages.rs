use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::logs::{self, StageLog};
use crate::pipeline::build;
use crate::pipeline::stage::{Stage, StatusUpdate};
use crate::store::AppState;

use super::helpers;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages",
            get(list_stages),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}",
            get(get_stage).post(update_stage),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}/run",
            post(run_stage),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}/logs",
            get(stage_logs),
        )
}

async fn list_stages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<Vec<Stage>>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    // surface a 404 for missing builds rather than an empty list
    build::get(&state, &pipeline.id, number).await.map_err(ApiError::from)?;
    let stages = build::list_stages(&state, &pipeline.id, number)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(stages))
}

async fn get_stage(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number, index)): Path<(String, String, u64, u32)>,
) -> Result<Json<Stage>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let stage = build::get_stage(&state, &pipeline.id, number, index)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(stage))
}

/// Status callback from a workload agent.
#[tracing::instrument(skip(state, auth, update), fields(%owner, %repo, number, index, status = %update.status), err)]
async fn update_stage(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number, index)): Path<(String, String, u64, u32)>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Stage>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let scm = helpers::pipeline_client(&state, &pipeline).await?;

    let stage = build::update(&state, scm.as_ref(), &pipeline, number, index, update)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(stage))
}

/// Resume a WAITING block stage.
#[tracing::instrument(skip(state, auth), err)]
async fn run_stage(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number, index)): Path<(String, String, u64, u32)>,
) -> Result<Json<Stage>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let scm = helpers::pipeline_client(&state, &pipeline).await?;

    let stage = build::resume(&state, scm.as_ref(), &pipeline, number, index)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(stage))
}

async fn stage_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number, index)): Path<(String, String, u64, u32)>,
) -> Result<Json<Vec<StageLog>>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let record = build::get(&state, &pipeline.id, number)
        .await
        .map_err(ApiError::from)?;
    let stage = build::get_stage(&state, &pipeline.id, number, index)
        .await
        .map_err(ApiError::from)?;

    let logs = logs::fetch(&state, &pipeline, &record, &stage)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(logs))
}
