//! Engine-side execution of deploy stages.
//!
//! Manifests are resolved from the repository at the build's commit, rendered
//! through the templating engine with the merged var map, optionally rewritten
//! to keep services cluster-internal, and submitted with server-side apply.

use std::collections::BTreeMap;

use crate::scm::SourceHost;
use crate::store::AppState;

use super::build::Build;
use super::error::PipelineError;
use super::registry::Pipeline;
use super::stage::{Stage, StageParams};

#[tracing::instrument(
    skip(state, scm, pipeline, build, stage),
    fields(pipeline = %pipeline.full_name(), build = build.number, stage = stage.index),
    err
)]
pub async fn execute(
    state: &AppState,
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    build: &Build,
    stage: &Stage,
) -> Result<(), PipelineError> {
    let StageParams::Deploy {
        deploy_file,
        deploy_dir,
        expose,
        ..
    } = &stage.spec
    else {
        return Err(PipelineError::Validation(format!(
            "stage {} is not a deploy stage",
            stage.index
        )));
    };

    if deploy_file.is_none() && deploy_dir.is_none() {
        return Err(PipelineError::Validation(
            "deploy stage needs deploy_file or deploy_dir".into(),
        ));
    }

    let reference = if build.commit.is_empty() {
        &build.branch
    } else {
        &build.commit
    };

    let mut sources: Vec<(String, Vec<u8>)> = Vec::new();
    if let Some(file) = deploy_file {
        let content = fetch_manifest(scm, pipeline, file, reference).await?;
        sources.push((file.clone(), content));
    }
    if let Some(dir) = deploy_dir {
        let entries = scm
            .get_directory_content(&pipeline.owner, &pipeline.repo, dir, reference)
            .await?;
        for entry in entries {
            if entry.entry_type == "file" && is_manifest_file(&entry.name) {
                let content = fetch_manifest(scm, pipeline, &entry.path, reference).await?;
                sources.push((entry.path, content));
            }
        }
    }

    let mut vars = pipeline.vars.clone();
    vars.extend(stage.vars.clone());

    for (path, content) in sources {
        let text = String::from_utf8_lossy(&content);
        let rendered = render(&text, &vars)?;
        for doc in split_yaml_documents(&rendered) {
            let mut manifest: serde_json::Value = serde_yaml::from_str(&doc)
                .map_err(|e| PipelineError::RenderFailed(format!("{path}: {e}")))?;
            if !expose {
                rewrite_service_type(&mut manifest);
            }
            let applied = state
                .cluster
                .apply_manifest(&stage.namespace, &manifest)
                .await?;
            tracing::info!(kind = %applied.kind, name = %applied.name, source = %path, "manifest applied");
        }
    }

    Ok(())
}

async fn fetch_manifest(
    scm: &dyn SourceHost,
    pipeline: &Pipeline,
    path: &str,
    reference: &str,
) -> Result<Vec<u8>, PipelineError> {
    scm.get_file_content(&pipeline.owner, &pipeline.repo, path, reference)
        .await
        .map_err(|_| {
            PipelineError::SpecUnavailable(format!(
                "{path} not found for {} at {reference}",
                pipeline.full_name()
            ))
        })
}

fn is_manifest_file(name: &str) -> bool {
    name.ends_with(".yml") || name.ends_with(".yaml")
}

/// Render a manifest template with the merged var map.
///
/// Standard Jinja syntax; the engine is sandboxed, so template content cannot
/// reach files or code.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, PipelineError> {
    let mut env = minijinja::Environment::new();
    env.add_template("manifest", template)
        .map_err(|e| PipelineError::RenderFailed(e.to_string()))?;
    let tmpl = env
        .get_template("manifest")
        .map_err(|e| PipelineError::RenderFailed(e.to_string()))?;
    tmpl.render(minijinja::Value::from_serialize(vars))
        .map_err(|e| PipelineError::RenderFailed(e.to_string()))
}

/// Split a rendered multi-document YAML string into individual documents.
pub fn split_yaml_documents(yaml: &str) -> Vec<String> {
    yaml.split("\n---")
        .map(|doc| doc.trim_start_matches("---").trim().to_owned())
        .filter(|doc| {
            !doc.is_empty()
                && doc
                    .lines()
                    .any(|line| !line.trim().is_empty() && !line.trim().starts_with('#'))
        })
        .collect()
}

/// `expose = false` keeps services cluster-internal.
fn rewrite_service_type(manifest: &mut serde_json::Value) {
    if manifest["kind"].as_str() == Some("Service")
        && manifest["spec"]["type"].as_str() == Some("LoadBalancer")
    {
        manifest["spec"]["type"] = serde_json::json!("ClusterIP");
    }
}
