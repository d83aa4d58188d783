pub mod slack;

use std::collections::BTreeMap;

use crate::pipeline::build::Build;
use crate::pipeline::registry::{Notifier, Pipeline};
use crate::pipeline::stage::{RunStatus, Stage};
use crate::store::AppState;

/// Per-stage outcome line included in terminal notifications.
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub status: RunStatus,
}

/// Fan a terminal build out to every configured notifier.
///
/// Notifier failures are logged and swallowed: they never affect build
/// terminality.
#[tracing::instrument(
    skip(state, pipeline, build, stages),
    fields(pipeline = %pipeline.full_name(), build = build.number, status = %build.status)
)]
pub async fn build_finished(
    state: &AppState,
    pipeline: &Pipeline,
    build: &Build,
    stages: &[Stage],
) {
    if pipeline.notifiers.is_empty() {
        return;
    }

    let summaries: Vec<StageSummary> = stages
        .iter()
        .map(|s| StageSummary {
            name: s.name.clone(),
            status: s.status,
        })
        .collect();

    for notifier in &pipeline.notifiers {
        let metadata = resolve_metadata(state, pipeline, notifier).await;
        let result = match notifier.notifier_type.as_str() {
            "slack" => slack::post(&pipeline.full_name(), build, &summaries, &metadata).await,
            other => {
                tracing::warn!(notifier = %other, "unknown notifier type, skipping");
                continue;
            }
        };

        if let Err(e) = result {
            tracing::error!(
                notifier = %notifier.notifier_type,
                error = %e,
                "notification delivery failed"
            );
        }
    }
}

/// Resolve notifier metadata references against the pipeline's secrets.
///
/// Each metadata value names a key inside the pipeline's secrets; when the
/// key resolves, the secret value (trimmed once) replaces it, otherwise the
/// literal stays. Lookup is case-sensitive.
pub async fn resolve_metadata(
    state: &AppState,
    pipeline: &Pipeline,
    notifier: &Notifier,
) -> BTreeMap<String, String> {
    let mut secrets: BTreeMap<String, String> = BTreeMap::new();
    for name in &pipeline.secrets {
        match state.cluster.get_secret(&notifier.namespace, name).await {
            Ok(data) => {
                secrets.extend(data.into_iter().map(|(k, v)| (k, v.trim().to_owned())));
            }
            Err(e) => {
                tracing::warn!(secret = %name, namespace = %notifier.namespace, error = %e, "notifier secret unavailable");
            }
        }
    }

    notifier
        .metadata
        .iter()
        .map(|(key, value)| {
            let resolved = secrets.get(value).cloned().unwrap_or_else(|| value.clone());
            (key.clone(), resolved)
        })
        .collect()
}
