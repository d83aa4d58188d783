use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify;
use crate::scm::{CommitState, HookEvent, SourceHost};
use crate::store::paths;
use crate::store::{AppState, StoreError};

use super::error::PipelineError;
use super::registry::{self, Pipeline};
use super::stage::{RunStatus, Stage, StageParams, StatusUpdate, Transition};
use super::{deploy, jobbuilder, now_ns};

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One ordered execution of a pipeline, triggered by an event.
///
/// `number` is dense and strictly monotonic within the pipeline: it is the
/// name of this record's KV directory entry, allocated by the store's ordered
/// create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub number: u64,
    pub status: RunStatus,
    pub commit: String,
    pub branch: String,
    pub author: String,
    pub event: String,
    pub clone_url: String,
    #[serde(default)]
    pub created_ns: i64,
    #[serde(default)]
    pub started_ns: i64,
    #[serde(default)]
    pub finished_ns: i64,
    /// 1-based index of the stage the build is currently at.
    pub current_stage: u32,
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub async fn get(state: &AppState, pipeline_id: &str, number: u64) -> Result<Build, PipelineError> {
    let bytes = match state.kv.get(&paths::build(pipeline_id, number)).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("build {number}")));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt build record {number}: {e}")))
}

pub async fn list(state: &AppState, pipeline_id: &str) -> Result<Vec<Build>, PipelineError> {
    let entries = state.kv.list_directory(&paths::builds_dir(pipeline_id)).await?;
    let mut builds = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_slice(&entry.value) {
            Ok(b) => builds.push(b),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping corrupt build record"),
        }
    }
    Ok(builds)
}

pub async fn get_stage(
    state: &AppState,
    pipeline_id: &str,
    number: u64,
    index: u32,
) -> Result<Stage, PipelineError> {
    let bytes = match state.kv.get(&paths::stage(pipeline_id, number, index)).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("stage {index}")));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt stage record {index}: {e}")))
}

pub async fn list_stages(
    state: &AppState,
    pipeline_id: &str,
    number: u64,
) -> Result<Vec<Stage>, PipelineError> {
    let entries = state
        .kv
        .list_directory(&paths::stages_dir(pipeline_id, number))
        .await?;
    let mut stages = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_slice(&entry.value) {
            Ok(s) => stages.push(s),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping corrupt stage record"),
        }
    }
    Ok(stages)
}

async fn save_build(
    state: &AppState,
    pipeline_id: &str,
    build: &Build,
) -> Result<(), PipelineError> {
    let record = serde_json::to_vec(build).map_err(anyhow::Error::from)?;
    crate::store::put(
        state.kv.as_ref(),
        &paths::build(pipeline_id, build.number),
        record,
    )
    .await?;
    Ok(())
}

async fn save_stage(
    state: &AppState,
    pipeline_id: &str,
    number: u64,
    stage: &Stage,
) -> Result<(), PipelineError> {
    let record = serde_json::to_vec(stage).map_err(anyhow::Error::from)?;
    crate::store::put(
        state.kv.as_ref(),
        &paths::stage(pipeline_id, number, stage.index),
        record,
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Materialise an event into a new build: parse the spec at the event's
/// commit, allocate the next dense build number, persist the build and its
/// frozen stages in PENDING, post pending statuses upstream, and dispatch
/// stage 1.
#[tracing::instrument(
    skip(state, scm, pipeline, hook),
    fields(pipeline = %pipeline.full_name(), commit = %hook.commit),
    err
)]
pub async fn create(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &mut Pipeline,
    hook: &HookEvent,
) -> Result<Build, PipelineError> {
    let definition = pipeline.definition(scm, &hook.commit).await?;
    let stages = definition.freeze_stages()?;

    // the spec is also the source of notifier/secret/var configuration
    registry::update_from_definition(state, pipeline, &definition).await?;

    let mut build = Build {
        id: Uuid::new_v4().to_string(),
        number: 0,
        status: RunStatus::Pending,
        commit: hook.commit.clone(),
        branch: hook.branch.clone(),
        author: hook.author.clone(),
        event: hook.event.clone(),
        clone_url: hook.clone_url.clone(),
        created_ns: now_ns(),
        started_ns: 0,
        finished_ns: 0,
        current_stage: 1,
    };

    // the ordered create is the allocation point: the assigned directory
    // entry name is the build number
    let placeholder = serde_json::to_vec(&build).map_err(anyhow::Error::from)?;
    let key = state
        .kv
        .create_in_directory(&paths::builds_dir(&pipeline.id), placeholder)
        .await?;
    build.number = key
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("unparseable build key {key}"))?;
    save_build(state, &pipeline.id, &build).await?;

    for stage in &stages {
        let record = serde_json::to_vec(stage).map_err(anyhow::Error::from)?;
        state
            .kv
            .create(&paths::stage(&pipeline.id, build.number, stage.index), record)
            .await?;
    }

    if build.branch != build.commit {
        for stage in &stages {
            post_status(scm, pipeline, &build, stage, CommitState::Pending).await;
        }
    }

    tracing::info!(number = build.number, stages = stages.len(), "build created");

    dispatch_first(state, scm, pipeline, &mut build).await?;
    Ok(build)
}

async fn dispatch_first(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &mut Build,
) -> Result<(), PipelineError> {
    let mut first = get_stage(state, &pipeline.id, build.number, 1).await?;
    if let Some(outcome) = dispatch(state, scm, pipeline, build, &mut first).await? {
        apply_chain(state, scm, pipeline, build, 1, outcome).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Launch a stage.
///
/// Workload stages return `None`: the next transition arrives as a status
/// callback. Block stages park in WAITING and return `None`. Deploy stages
/// execute synchronously in the engine and return their terminal update.
async fn dispatch(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &mut Build,
    stage: &mut Stage,
) -> Result<Option<StatusUpdate>, PipelineError> {
    match &stage.spec {
        StageParams::Block { .. } => {
            stage.ensure_transition(RunStatus::Waiting)?;
            stage.status = RunStatus::Waiting;
            save_stage(state, &pipeline.id, build.number, stage).await?;
            tracing::info!(stage = stage.index, "stage waiting for external resume");
            Ok(None)
        }
        StageParams::Deploy { .. } => {
            apply_one(state, scm, pipeline, build, stage, &StatusUpdate::new(RunStatus::Running, now_ns()))
                .await?;
            match deploy::execute(state, scm, pipeline, build, stage).await {
                Ok(()) => Ok(Some(StatusUpdate::new(RunStatus::Success, now_ns()))),
                Err(e) => {
                    tracing::error!(stage = stage.index, error = %e, "deploy stage failed");
                    let mut update = StatusUpdate::new(RunStatus::Fail, now_ns());
                    update.message = Some(e.to_string());
                    Ok(Some(update))
                }
            }
        }
        _ => {
            let secrets = resolve_secrets(state, pipeline, stage).await;
            let hook_token = crate::auth::token::issue_hook_token(
                &state.config.jwt_secret,
                &pipeline.owner,
                &pipeline.repo,
            )
            .map_err(anyhow::Error::from)?;

            let workload = jobbuilder::render(&jobbuilder::RunContext {
                config: &state.config,
                pipeline,
                build,
                stage,
                secrets: &secrets,
                access_token: scm.access_token(),
                hook_token: &hook_token,
            });

            match state.cluster.create_workload(&workload).await {
                Ok(()) => {
                    stage.workload_name = workload.name;
                    save_stage(state, &pipeline.id, build.number, stage).await?;
                    Ok(None)
                }
                Err(e) => {
                    tracing::error!(stage = stage.index, error = %e, "workload dispatch failed");
                    let mut update = StatusUpdate::new(RunStatus::Fail, now_ns());
                    update.message = Some(e.to_string());
                    Ok(Some(update))
                }
            }
        }
    }
}

/// Union of pipeline-level and stage-level secret names, fetched from the
/// stage's namespace. A missing secret is a warning, not a failure.
async fn resolve_secrets(
    state: &AppState,
    pipeline: &Pipeline,
    stage: &Stage,
) -> std::collections::BTreeMap<String, String> {
    let mut resolved = std::collections::BTreeMap::new();
    let names = pipeline.secrets.iter().chain(stage.secrets.iter());
    for name in names {
        match state.cluster.get_secret(&stage.namespace, name).await {
            Ok(data) => resolved.extend(data),
            Err(e) => {
                tracing::warn!(secret = %name, namespace = %stage.namespace, error = %e, "secret unavailable");
            }
        }
    }
    resolved
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

/// Consume a status callback for `(build_number, stage_index)`.
///
/// Applies the stage transition, mirrors it upstream, advances to the next
/// stage on success, finalises the build on the last stage or on failure, and
/// fans out notifications on terminal build state. Returns the updated stage.
#[tracing::instrument(
    skip(state, scm, pipeline, update),
    fields(pipeline = %pipeline.full_name(), build = build_number, stage = stage_index, status = %update.status),
    err
)]
pub async fn update(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build_number: u64,
    stage_index: u32,
    update: StatusUpdate,
) -> Result<Stage, PipelineError> {
    if !matches!(
        update.status,
        RunStatus::Running | RunStatus::Success | RunStatus::Fail
    ) {
        return Err(PipelineError::Validation(format!(
            "status updates must be RUNNING, SUCCESS or FAIL, got {}",
            update.status
        )));
    }

    let mut build = get(state, &pipeline.id, build_number).await?;

    // terminal builds are immutable; late callbacks for skipped stages must
    // not resurrect them
    if build.status.is_terminal() {
        return Err(PipelineError::IllegalTransition {
            from: build.status.to_string(),
            to: update.status.to_string(),
        });
    }

    apply_chain(state, scm, pipeline, &mut build, stage_index, update).await
}

/// Resume a WAITING block stage: transition it to RUNNING and dispatch the
/// same workload semantics as a command stage.
pub async fn resume(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build_number: u64,
    stage_index: u32,
) -> Result<Stage, PipelineError> {
    let mut build = get(state, &pipeline.id, build_number).await?;
    let mut stage = get_stage(state, &pipeline.id, build_number, stage_index).await?;

    if build.status.is_terminal() {
        return Err(PipelineError::IllegalTransition {
            from: build.status.to_string(),
            to: RunStatus::Running.to_string(),
        });
    }

    if stage.status != RunStatus::Waiting {
        return Err(PipelineError::IllegalTransition {
            from: stage.status.to_string(),
            to: RunStatus::Running.to_string(),
        });
    }

    apply_one(
        state,
        scm,
        pipeline,
        &mut build,
        &mut stage,
        &StatusUpdate::new(RunStatus::Running, now_ns()),
    )
    .await?;

    let secrets = resolve_secrets(state, pipeline, &stage).await;
    let hook_token = crate::auth::token::issue_hook_token(
        &state.config.jwt_secret,
        &pipeline.owner,
        &pipeline.repo,
    )
    .map_err(anyhow::Error::from)?;
    let workload = jobbuilder::render(&jobbuilder::RunContext {
        config: &state.config,
        pipeline,
        build: &build,
        stage: &stage,
        secrets: &secrets,
        access_token: scm.access_token(),
        hook_token: &hook_token,
    });

    if let Err(e) = state.cluster.create_workload(&workload).await {
        tracing::error!(stage = stage.index, error = %e, "resume dispatch failed");
        let mut fail = StatusUpdate::new(RunStatus::Fail, now_ns());
        fail.message = Some(e.to_string());
        return apply_chain(state, scm, pipeline, &mut build, stage_index, fail).await;
    }

    stage.workload_name = workload.name;
    save_stage(state, &pipeline.id, build.number, &stage).await?;
    Ok(stage)
}

/// Apply one update and keep going while stages complete synchronously
/// (deploy stages, dispatch failures). Iterative so a run of consecutive
/// deploy stages cannot recurse.
async fn apply_chain(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &mut Build,
    stage_index: u32,
    update: StatusUpdate,
) -> Result<Stage, PipelineError> {
    let mut index = stage_index;
    let mut pending = Some(update);
    let mut result: Option<Stage> = None;

    while let Some(update) = pending.take() {
        let mut stage = get_stage(state, &pipeline.id, build.number, index).await?;

        if stage.ensure_transition(update.status)? == Transition::Noop {
            if result.is_none() {
                result = Some(stage);
            }
            break;
        }

        apply_one(state, scm, pipeline, build, &mut stage, &update).await?;

        if update.status == RunStatus::Success {
            match get_stage(state, &pipeline.id, build.number, index + 1).await {
                Ok(mut next) => {
                    build.current_stage = next.index;
                    save_build(state, &pipeline.id, build).await?;
                    if let Some(outcome) =
                        dispatch(state, scm, pipeline, build, &mut next).await?
                    {
                        index = next.index;
                        pending = Some(outcome);
                    }
                }
                Err(PipelineError::NotFound(_)) => {
                    build.status = RunStatus::Success;
                    build.finished_ns = update.timestamp_ns;
                    save_build(state, &pipeline.id, build).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if result.is_none() || result.as_ref().is_some_and(|s| s.index == stage.index) {
            result = Some(stage);
        }

        if build.status.is_terminal() && build.finished_ns != 0 {
            let stages = list_stages(state, &pipeline.id, build.number).await?;
            notify::build_finished(state, pipeline, build, &stages).await;
            break;
        }
    }

    // the caller asked about stage_index; reload in case a later chain step
    // did not touch it
    match result {
        Some(stage) if stage.index == stage_index => Ok(stage),
        _ => get_stage(state, &pipeline.id, build.number, stage_index).await,
    }
}

/// Apply a single validated update to a stage and its build, persist both,
/// and mirror the transition upstream. No advancement happens here.
async fn apply_one(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &mut Build,
    stage: &mut Stage,
    update: &StatusUpdate,
) -> Result<(), PipelineError> {
    stage.ensure_transition(update.status)?;
    stage.record_callback_details(update);

    match update.status {
        RunStatus::Running => {
            stage.status = RunStatus::Running;
            stage.started_ns = update.timestamp_ns;
            build.status = RunStatus::Running;
            if stage.index == 1 {
                build.started_ns = update.timestamp_ns;
            }
        }
        RunStatus::Success => {
            stage.status = RunStatus::Success;
            stage.finished_ns = update.timestamp_ns;
        }
        RunStatus::Fail => {
            stage.status = RunStatus::Fail;
            stage.finished_ns = update.timestamp_ns;
            build.status = RunStatus::Fail;
            build.finished_ns = update.timestamp_ns;
        }
        // dispatch() writes WAITING directly; updates never carry it
        RunStatus::Pending | RunStatus::Waiting => {
            return Err(PipelineError::Validation(format!(
                "unsupported status update {}",
                update.status
            )));
        }
    }

    save_stage(state, &pipeline.id, build.number, stage).await?;
    save_build(state, &pipeline.id, build).await?;

    if build.branch != build.commit {
        let commit_state = match update.status {
            RunStatus::Running => CommitState::Pending,
            RunStatus::Success => CommitState::Success,
            _ => CommitState::Failure,
        };
        post_status(scm, pipeline, build, stage, commit_state).await;
    }

    Ok(())
}

/// Upstream status posts are best-effort: failures are logged and never
/// revert stage state.
async fn post_status(
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &Build,
    stage: &Stage,
    state: CommitState,
) {
    if let Err(e) = scm
        .create_status(
            &pipeline.owner,
            &pipeline.repo,
            &build.commit,
            stage.index,
            &stage.name,
            state,
        )
        .await
    {
        tracing::warn!(
            stage = stage.index,
            state = state.as_str(),
            error = %e,
            "upstream status post failed"
        );
    }
}
