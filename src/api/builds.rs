use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::pipeline::build;
use crate::scm::{self, HookEvent, SourceHost};
use crate::store::AppState;

use super::helpers;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds",
            get(list_builds).post(trigger_build),
        )
        .route(
            "/api/v1/pipelines/{owner}/{repo}/builds/{number}",
            get(get_build),
        )
}

/// Custom trigger body (dashboard or CLI events).
#[derive(Debug, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    author: String,
}

async fn list_builds(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<Vec<build::Build>>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let builds = build::list(&state, &pipeline.id).await.map_err(ApiError::from)?;
    Ok(Json(builds))
}

async fn get_build(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<build::Build>, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let record = build::get(&state, &pipeline.id, number)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(record))
}

/// Create a build from an incoming event.
///
/// Source-host webhook deliveries are recognised by their event header;
/// anything else must be a custom trigger (`X-Custom-Event: dashboard|cli`)
/// carrying a [`TriggerRequest`] body.
#[tracing::instrument(skip(state, auth, headers, body), fields(%owner, %repo), err)]
async fn trigger_build(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    helpers::authorize(&auth, &owner, &repo)?;
    let mut pipeline = helpers::find_pipeline(&state, &owner, &repo).await?;
    let scm = helpers::pipeline_client(&state, &pipeline).await?;

    let remote_event = headers
        .get("X-Github-Event")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let custom_event = headers
        .get("X-Custom-Event")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let hook = match (remote_event, custom_event) {
        // hook installation checks are acknowledged, not built
        (Some(event), _) if event == scm::EVENT_PING => {
            return Ok((StatusCode::OK, Json(serde_json::Value::Null)));
        }
        (Some(event), _) => scm
            .parse_hook_payload(&event, &body)
            .map_err(ApiError::from)?,
        (None, Some(event))
            if event == scm::EVENT_DASHBOARD || event == scm::EVENT_CLI =>
        {
            let trigger: TriggerRequest = serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("invalid trigger body: {e}")))?;
            custom_hook(scm.as_ref(), &owner, &repo, &event, &trigger.author).await?
        }
        _ => return Err(ApiError::Unauthorized),
    };

    let record = build::create(&state, scm.as_ref(), &mut pipeline, &hook)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(serde_json::to_value(record).unwrap_or_default())))
}

/// Manual triggers run the head of the default branch.
async fn custom_hook(
    scm: &dyn SourceHost,
    owner: &str,
    repo: &str,
    event: &str,
    author: &str,
) -> Result<HookEvent, ApiError> {
    let source = scm.get_repository(owner, repo).await.map_err(ApiError::from)?;
    Ok(HookEvent {
        author: author.to_owned(),
        branch: source.default_branch.clone(),
        commit: source.default_branch,
        clone_url: source.clone_url,
        event: event.to_owned(),
    })
}
