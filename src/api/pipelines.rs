use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::{AuthUser, Identity};
use crate::error::ApiError;
use crate::pipeline::definition::{self, PIPELINE_YAML};
use crate::pipeline::registry::{self, NewPipeline, Notifier, Pipeline};
use crate::store::AppState;

use super::helpers;

/// API view of a pipeline. Deploy-key material never leaves the store.
#[derive(Debug, Serialize)]
pub struct PipelineResponse {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub source: String,
    pub login: String,
    pub events: Vec<String>,
    pub notifiers: Vec<Notifier>,
    pub secrets: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

impl From<Pipeline> for PipelineResponse {
    fn from(p: Pipeline) -> Self {
        Self {
            id: p.id,
            owner: p.owner,
            repo: p.repo,
            source: p.source,
            login: p.login,
            events: p.events,
            notifiers: p.notifiers,
            secrets: p.secrets,
            vars: p.vars,
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/api/v1/pipelines/{owner}/{repo}",
            get(get_pipeline).delete(delete_pipeline),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/definition",
            get(get_definition).post(put_definition),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/definition/{reference}",
            get(get_definition_at).post(put_definition_at),
        )
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

async fn list_pipelines(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<PipelineResponse>>, ApiError> {
    let pipelines = registry::list(&state).await.map_err(ApiError::from)?;
    Ok(Json(pipelines.into_iter().map(Into::into).collect()))
}

#[tracing::instrument(skip(state, auth, body), fields(owner = %body.owner, repo = %body.repo), err)]
async fn create_pipeline(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<NewPipeline>,
) -> Result<impl IntoResponse, ApiError> {
    let Identity::User { login, .. } = &auth.identity else {
        return Err(ApiError::Unauthorized);
    };
    let login = login.clone();

    let scm = helpers::caller_client(&state, &auth).await?;
    let pipeline = registry::create(&state, scm.as_ref(), body, &login)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(PipelineResponse::from(pipeline))))
}

async fn get_pipeline(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<PipelineResponse>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    Ok(Json(pipeline.into()))
}

#[tracing::instrument(skip(state, auth), err)]
async fn delete_pipeline(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let Identity::User { .. } = &auth.identity else {
        return Err(ApiError::Unauthorized);
    };
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    registry::delete(&state, &pipeline).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Spec file access
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PutDefinitionRequest {
    /// Raw spec YAML to write to the repository.
    content: String,
    #[serde(default)]
    message: Option<String>,
}

async fn get_definition(
    state: State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<definition::Definition>, ApiError> {
    fetch_definition(state, auth, owner, repo, None).await
}

async fn get_definition_at(
    state: State<AppState>,
    auth: AuthUser,
    Path((owner, repo, reference)): Path<(String, String, String)>,
) -> Result<Json<definition::Definition>, ApiError> {
    fetch_definition(state, auth, owner, repo, Some(reference)).await
}

async fn fetch_definition(
    State(state): State<AppState>,
    auth: AuthUser,
    owner: String,
    repo: String,
    reference: Option<String>,
) -> Result<Json<definition::Definition>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let scm = helpers::pipeline_client(&state, &pipeline).await?;

    let reference = match reference {
        Some(r) => r,
        None => {
            scm.get_repository(&owner, &repo)
                .await
                .map_err(ApiError::from)?
                .default_branch
        }
    };

    let definition = pipeline
        .definition(scm.as_ref(), &reference)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(definition))
}

async fn put_definition(
    state: State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
    body: Json<PutDefinitionRequest>,
) -> Result<StatusCode, ApiError> {
    write_definition(state, auth, owner, repo, None, body).await
}

async fn put_definition_at(
    state: State<AppState>,
    auth: AuthUser,
    Path((owner, repo, reference)): Path<(String, String, String)>,
    body: Json<PutDefinitionRequest>,
) -> Result<StatusCode, ApiError> {
    write_definition(state, auth, owner, repo, Some(reference), body).await
}

/// Validate and commit a spec file to the repository.
#[tracing::instrument(skip(state, auth, body), err)]
async fn write_definition(
    State(state): State<AppState>,
    auth: AuthUser,
    owner: String,
    repo: String,
    reference: Option<String>,
    Json(body): Json<PutDefinitionRequest>,
) -> Result<StatusCode, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let scm = helpers::pipeline_client(&state, &pipeline).await?;

    // reject malformed specs before they reach the repository
    definition::parse(body.content.as_bytes()).map_err(ApiError::from)?;

    let branch = match reference {
        Some(r) => r,
        None => {
            scm.get_repository(&owner, &repo)
                .await
                .map_err(ApiError::from)?
                .default_branch
        }
    };

    let previous = scm
        .get_file_sha(&owner, &repo, PIPELINE_YAML, &branch)
        .await
        .map_err(ApiError::from)?;
    let message = body
        .message
        .unwrap_or_else(|| format!("Update {PIPELINE_YAML}"));

    scm.create_or_update_file(
        &owner,
        &repo,
        PIPELINE_YAML,
        &branch,
        &message,
        body.content.as_bytes(),
        previous.as_deref(),
    )
    .await
    .map_err(ApiError::from)?;

    Ok(StatusCode::CREATED)
}
