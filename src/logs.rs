//! Stage log aggregation.
//!
//! Running stages stream from the pod the workload labels point at; finished
//! stages read the archived objects the agent uploaded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;

use crate::pipeline::build::Build;
use crate::pipeline::error::PipelineError;
use crate::pipeline::registry::Pipeline;
use crate::pipeline::stage::{RunStatus, Stage};
use crate::store::paths;
use crate::store::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct StageLog {
    pub filename: String,
    pub content: String,
}

pub async fn fetch(
    state: &AppState,
    pipeline: &Pipeline,
    build: &Build,
    stage: &Stage,
) -> Result<Vec<StageLog>, PipelineError> {
    if stage.status == RunStatus::Running {
        live_logs(state, pipeline, build, stage).await
    } else {
        archived_logs(state, pipeline, build, stage).await
    }
}

/// Current log text of every container of the stage's pod, located by the
/// `(pipeline, build, stage)` label triple.
async fn live_logs(
    state: &AppState,
    pipeline: &Pipeline,
    build: &Build,
    stage: &Stage,
) -> Result<Vec<StageLog>, PipelineError> {
    let selector = format!(
        "pipeline={},build={},stage={}",
        pipeline.id, build.number, stage.index
    );
    let pods = state
        .cluster
        .list_pods_by_label(&stage.namespace, &selector)
        .await?;
    let Some(pod) = pods.first() else {
        return Err(PipelineError::NotFound(format!(
            "pod for stage {}",
            stage.index
        )));
    };

    let containers = state
        .cluster
        .list_pod_containers(&stage.namespace, pod)
        .await?;

    let mut logs = Vec::with_capacity(containers.len());
    for container in containers {
        let content = state
            .cluster
            .get_pod_log(&stage.namespace, pod, &container)
            .await?;
        logs.push(StageLog {
            filename: container,
            content,
        });
    }
    Ok(logs)
}

/// Archived logs from the object store, base64-encoded, key-ascending.
async fn archived_logs(
    state: &AppState,
    pipeline: &Pipeline,
    build: &Build,
    stage: &Stage,
) -> Result<Vec<StageLog>, PipelineError> {
    let prefix = paths::stage_logs(&pipeline.id, build.number, stage.index);
    let keys = state.artifacts.list_by_prefix(&prefix).await?;

    let mut logs = Vec::with_capacity(keys.len());
    for key in keys {
        let body = state.artifacts.read(&key).await?;
        logs.push(StageLog {
            filename: key,
            content: BASE64.encode(body),
        });
    }
    Ok(logs)
}
