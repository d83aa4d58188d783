use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::token;
use crate::scm::{ScmError, SourceHost};
use crate::store::paths;
use crate::store::{AppState, StoreError};

use super::definition::{self, Definition, PIPELINE_YAML};
use super::error::PipelineError;

/// The one event every pipeline must subscribe to.
pub const REQUIRED_EVENT: &str = "push";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// RSA keypair registered with the source host as a deploy key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployKey {
    pub public: String,
    pub private: String,
}

/// A configured outbound notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notifier {
    #[serde(rename = "type")]
    pub notifier_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub namespace: String,
}

/// Long-lived registration binding a source repository to an execution spec
/// and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub owner: String,
    pub repo: String,
    /// Source host kind, e.g. "github".
    pub source: String,
    /// Login of the user whose credentials drive source-host calls.
    pub login: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub keys: DeployKey,
    #[serde(default)]
    pub notifiers: Vec<Notifier>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Pipeline {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.owner.is_empty() {
            return Err(PipelineError::Validation("owner is required".into()));
        }
        if self.repo.is_empty() {
            return Err(PipelineError::Validation("repo is required".into()));
        }
        if self.login.is_empty() {
            return Err(PipelineError::Validation("login is required".into()));
        }
        if self.source.is_empty() {
            return Err(PipelineError::Validation("source is required".into()));
        }
        if self.events.is_empty() {
            return Err(PipelineError::Validation(format!(
                "events is required; must include '{REQUIRED_EVENT}'"
            )));
        }
        if !self.events.iter().any(|e| e == REQUIRED_EVENT) {
            return Err(PipelineError::Validation(format!(
                "the '{REQUIRED_EVENT}' event is required"
            )));
        }
        Ok(())
    }

    /// Fetch and parse the spec file at `reference`.
    pub async fn definition(
        &self,
        scm: &dyn SourceHost,
        reference: &str,
    ) -> Result<Definition, PipelineError> {
        let content = scm
            .get_file_content(&self.owner, &self.repo, PIPELINE_YAML, reference)
            .await
            .map_err(|e| match e {
                ScmError::NotFound(_) => PipelineError::SpecUnavailable(format!(
                    "{PIPELINE_YAML} not found for {} at {reference}",
                    self.full_name()
                )),
                other => PipelineError::Scm(other),
            })?;
        definition::parse(&content)
    }
}

// ---------------------------------------------------------------------------
// Create / provision
// ---------------------------------------------------------------------------

/// Fields accepted when registering a pipeline.
#[derive(Debug, Deserialize)]
pub struct NewPipeline {
    pub owner: String,
    pub repo: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Register a pipeline: validate, persist, and provision the deploy key and
/// webhook on the source host. Hooks already pointing at the callback URL are
/// not duplicated.
#[tracing::instrument(skip(state, scm, new), fields(owner = %new.owner, repo = %new.repo), err)]
pub async fn create(
    state: &AppState,
    scm: &dyn SourceHost,
    new: NewPipeline,
    login: &str,
) -> Result<Pipeline, PipelineError> {
    if find(state, &new.owner, &new.repo).await.is_ok() {
        return Err(PipelineError::AlreadyExists(format!(
            "pipeline {}/{}",
            new.owner, new.repo
        )));
    }

    let source = scm
        .get_repository(&new.owner, &new.repo)
        .await
        .map_err(|_| {
            PipelineError::Validation(format!(
                "repository {}/{} has no remote source on {}",
                new.owner,
                new.repo,
                scm.name()
            ))
        })?;

    if !source.admin {
        return Err(PipelineError::Validation(format!(
            "admin rights on {}/{} are required to create a pipeline",
            new.owner, new.repo
        )));
    }

    let mut pipeline = Pipeline {
        id: Uuid::new_v4().to_string(),
        owner: new.owner,
        repo: new.repo,
        source: scm.name().into(),
        login: login.into(),
        events: new.events,
        keys: generate_deploy_key()?,
        notifiers: Vec::new(),
        secrets: new.secrets,
        vars: new.vars,
    };
    pipeline.validate()?;

    // persist before touching the source host so a provisioning failure is
    // visible as an existing, incomplete pipeline rather than silence
    let record = serde_json::to_vec(&pipeline).map_err(anyhow::Error::from)?;
    state.kv.create(&paths::pipeline(&pipeline.id), record).await?;
    state
        .kv
        .create(
            &paths::pipeline_map(&pipeline.owner, &pipeline.repo),
            pipeline.id.clone().into_bytes(),
        )
        .await?;

    let callback = hook_callback_url(state, &pipeline)?;

    if !scm.hook_exists(&pipeline.owner, &pipeline.repo, &callback).await {
        scm.create_hook(&pipeline.owner, &pipeline.repo, &callback, &pipeline.events)
            .await?;
    }

    scm.create_deploy_key(&pipeline.owner, &pipeline.repo, &pipeline.keys.public, &callback)
        .await?;

    tracing::info!(pipeline_id = %pipeline.id, "pipeline created");
    Ok(pipeline)
}

/// Webhook callback URL with the signed per-pipeline token, so deliveries
/// authenticate back to this pipeline.
pub fn hook_callback_url(state: &AppState, pipeline: &Pipeline) -> Result<String, PipelineError> {
    let token = token::issue_hook_token(&state.config.jwt_secret, &pipeline.owner, &pipeline.repo)
        .map_err(anyhow::Error::from)?;
    Ok(format!(
        "{}/api/v1/pipelines/{}/{}/builds?id_token={}",
        state.config.external_url, pipeline.owner, pipeline.repo, token
    ))
}

fn generate_deploy_key() -> Result<DeployKey, PipelineError> {
    use ssh_key::private::{KeypairData, RsaKeypair};
    use ssh_key::rand_core::OsRng;
    use ssh_key::{LineEnding, PrivateKey};

    let keypair = RsaKeypair::random(&mut OsRng, 2048).map_err(|e| anyhow::anyhow!(e))?;
    let private =
        PrivateKey::new(KeypairData::Rsa(keypair), "gantry deploy key").map_err(|e| anyhow::anyhow!(e))?;

    Ok(DeployKey {
        public: private
            .public_key()
            .to_openssh()
            .map_err(|e| anyhow::anyhow!(e))?,
        private: private
            .to_openssh(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!(e))?
            .to_string(),
    })
}

// ---------------------------------------------------------------------------
// Lookup / save / delete
// ---------------------------------------------------------------------------

pub async fn find(state: &AppState, owner: &str, repo: &str) -> Result<Pipeline, PipelineError> {
    let id = match state.kv.get(&paths::pipeline_map(owner, repo)).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("pipeline {owner}/{repo}")));
        }
        Err(e) => return Err(e.into()),
    };
    get(state, &id).await
}

pub async fn get(state: &AppState, id: &str) -> Result<Pipeline, PipelineError> {
    let bytes = match state.kv.get(&paths::pipeline(id)).await {
        Ok(bytes) => bytes,
        Err(StoreError::NotFound(_)) => {
            return Err(PipelineError::NotFound(format!("pipeline {id}")));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt pipeline record {id}: {e}")))
}

pub async fn list(state: &AppState) -> Result<Vec<Pipeline>, PipelineError> {
    let entries = state.kv.list_directory(paths::PIPELINES).await?;
    let mut pipelines = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_slice(&entry.value) {
            Ok(p) => pipelines.push(p),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "skipping corrupt pipeline record"),
        }
    }
    Ok(pipelines)
}

pub async fn save(state: &AppState, pipeline: &Pipeline) -> Result<(), PipelineError> {
    let record = serde_json::to_vec(pipeline).map_err(anyhow::Error::from)?;
    crate::store::put(state.kv.as_ref(), &paths::pipeline(&pipeline.id), record).await?;
    Ok(())
}

/// Delete a pipeline and everything it owns: the KV subtree (builds, stages)
/// and every artifact and log object under its prefix.
#[tracing::instrument(skip(state, pipeline), fields(pipeline_id = %pipeline.id), err)]
pub async fn delete(state: &AppState, pipeline: &Pipeline) -> Result<(), PipelineError> {
    state
        .kv
        .delete(&paths::pipeline_map(&pipeline.owner, &pipeline.repo))
        .await?;
    state.kv.delete_subtree(&paths::pipeline(&pipeline.id)).await?;
    state
        .artifacts
        .delete_by_prefix(&paths::artifact_root(&pipeline.id))
        .await?;
    tracing::info!("pipeline deleted");
    Ok(())
}

/// Point the name map at a new `(owner, repo)`; the record id stays stable.
pub async fn rename(
    state: &AppState,
    pipeline: &mut Pipeline,
    owner: &str,
    repo: &str,
) -> Result<(), PipelineError> {
    let old_map = paths::pipeline_map(&pipeline.owner, &pipeline.repo);

    state
        .kv
        .create(&paths::pipeline_map(owner, repo), pipeline.id.clone().into_bytes())
        .await
        .map_err(|e| match e {
            StoreError::AlreadyExists(_) => {
                PipelineError::AlreadyExists(format!("pipeline {owner}/{repo}"))
            }
            other => other.into(),
        })?;

    pipeline.owner = owner.to_owned();
    pipeline.repo = repo.to_owned();
    save(state, pipeline).await?;
    state.kv.delete(&old_map).await?;
    Ok(())
}

/// Refresh notifier, secret and var configuration from a freshly parsed spec.
pub async fn update_from_definition(
    state: &AppState,
    pipeline: &mut Pipeline,
    definition: &Definition,
) -> Result<(), PipelineError> {
    let namespace = definition.namespace().to_owned();
    pipeline.notifiers = definition
        .spec
        .template
        .notifiers
        .iter()
        .map(|n| Notifier {
            notifier_type: n.notifier_type.clone(),
            metadata: n.metadata.clone(),
            namespace: namespace.clone(),
        })
        .collect();

    if !definition.spec.template.secrets.is_empty() {
        pipeline.secrets = definition.spec.template.secrets.clone();
    }
    if !definition.spec.template.vars.is_empty() {
        pipeline.vars = definition.spec.template.vars.clone();
    }

    save(state, pipeline).await
}
