use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::PipelineError;
use super::stage::{RunStatus, Stage, StageParams};

/// Spec file looked up in the repository at the build's commit.
pub const PIPELINE_YAML: &str = ".pipeline.yml";

const DEFAULT_NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parsed pipeline spec. Transient: stages derived from it are frozen into
/// the build record at creation, so later edits never mutate an in-flight
/// build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: SpecDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecDetails {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, serde_json::Value>,
    pub template: TemplateDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDetails {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub stages: Vec<StageDef>,
    #[serde(default, rename = "notif", skip_serializing_if = "Vec::is_empty")]
    pub notifiers: Vec<NotifierDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    #[serde(rename = "type", default = "default_stage_type")]
    pub stage_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

fn default_stage_type() -> String {
    "command".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierDef {
    #[serde(rename = "type")]
    pub notifier_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse spec YAML into a validated [`Definition`].
pub fn parse(yaml: &[u8]) -> Result<Definition, PipelineError> {
    if yaml.is_empty() {
        return Err(PipelineError::SpecInvalid("empty spec file".into()));
    }

    let definition: Definition = serde_yaml::from_slice(yaml)
        .map_err(|e| PipelineError::SpecInvalid(e.to_string()))?;

    validate(&definition)?;
    Ok(definition)
}

fn validate(definition: &Definition) -> Result<(), PipelineError> {
    if definition.spec.template.stages.is_empty() {
        return Err(PipelineError::SpecInvalid(
            "pipeline must have at least one stage".into(),
        ));
    }

    for (i, stage) in definition.spec.template.stages.iter().enumerate() {
        if stage.name.is_empty() {
            return Err(PipelineError::SpecInvalid(format!(
                "stage {} is missing a name",
                i + 1
            )));
        }
        // surfaces unknown types and mistyped fields before anything persists
        StageParams::from_spec(&stage.stage_type, &stage.params)?;
    }

    Ok(())
}

impl Definition {
    /// Namespace for workloads; missing `metadata.namespace` means "default",
    /// and the default propagates to every stage.
    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Freeze the spec's stage list into persistable stage records.
    ///
    /// Indices are 1-based and dense, matching the order in the spec.
    pub fn freeze_stages(&self) -> Result<Vec<Stage>, PipelineError> {
        let namespace = self.namespace().to_owned();
        self.spec
            .template
            .stages
            .iter()
            .enumerate()
            .map(|(i, def)| {
                Ok(Stage {
                    id: Uuid::new_v4().to_string(),
                    index: i as u32 + 1,
                    name: def.name.clone(),
                    spec: StageParams::from_spec(&def.stage_type, &def.params)?,
                    labels: BTreeMap::new(),
                    vars: def.vars.clone(),
                    secrets: def.secrets.clone(),
                    artifacts: def.artifacts.clone(),
                    status: RunStatus::Pending,
                    started_ns: 0,
                    finished_ns: 0,
                    workload_name: String::new(),
                    pod_name: String::new(),
                    image: String::new(),
                    message: String::new(),
                    namespace: namespace.clone(),
                })
            })
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::SpecInvalid(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
apiVersion: v1alpha1
kind: Pipeline
metadata:
  name: web
  namespace: ci
spec:
  template:
    stages:
      - name: build-image
        type: docker_build
        params:
          dockerfile_path: .
      - name: test
        type: command
        params:
          command: ["sh", "-c", "make test"]
        artifacts:
          - target/report.xml
        vars:
          RUST_LOG: debug
        secrets:
          - test-credentials
      - name: approve
        type: block
      - name: rollout
        type: deploy
        params:
          deploy_file: k8s/app.yml
          expose: false
    notif:
      - type: slack
        metadata:
          url: slack-url
          channel: slack-channel
          username: slack-user
    secrets:
      - registry-credentials
    vars:
      REGION: eu-west-1
"#;

    #[test]
    fn parse_valid_spec() {
        let def = parse(VALID_YAML.as_bytes()).unwrap();
        assert_eq!(def.kind, "Pipeline");
        assert_eq!(def.namespace(), "ci");
        assert_eq!(def.spec.template.stages.len(), 4);
        assert_eq!(def.spec.template.stages[0].stage_type, "docker_build");
        assert_eq!(def.spec.template.notifiers[0].notifier_type, "slack");
        assert_eq!(def.spec.template.secrets, vec!["registry-credentials"]);
        assert_eq!(def.spec.template.vars["REGION"], "eu-west-1");
    }

    #[test]
    fn parse_empty_input_fails() {
        let err = parse(b"").unwrap_err();
        assert!(matches!(err, PipelineError::SpecInvalid(_)));
    }

    #[test]
    fn parse_garbage_fails() {
        let err = parse(b"---invalid").unwrap_err();
        assert!(matches!(err, PipelineError::SpecInvalid(_)));
    }

    #[test]
    fn parse_requires_stages() {
        let yaml = r#"
apiVersion: v1alpha1
kind: Pipeline
spec:
  template:
    stages: []
"#;
        let err = parse(yaml.as_bytes()).unwrap_err();
        assert!(
            matches!(err, PipelineError::SpecInvalid(ref msg) if msg.contains("at least one stage")),
            "got: {err:?}"
        );
    }

    #[test]
    fn parse_requires_stage_names() {
        let yaml = r#"
apiVersion: v1alpha1
kind: Pipeline
spec:
  template:
    stages:
      - name: ""
        type: command
"#;
        let err = parse(yaml.as_bytes()).unwrap_err();
        assert!(
            matches!(err, PipelineError::SpecInvalid(ref msg) if msg.contains("missing a name")),
            "got: {err:?}"
        );
    }

    #[test]
    fn parse_rejects_unknown_stage_type() {
        let yaml = r#"
apiVersion: v1alpha1
kind: Pipeline
spec:
  template:
    stages:
      - name: x
        type: teleport
"#;
        let err = parse(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::SpecInvalid(_)));
    }

    #[test]
    fn missing_namespace_defaults_and_propagates() {
        let yaml = r#"
apiVersion: v1alpha1
kind: Pipeline
spec:
  template:
    stages:
      - name: test
        type: command
"#;
        let def = parse(yaml.as_bytes()).unwrap();
        assert_eq!(def.namespace(), "default");
        let stages = def.freeze_stages().unwrap();
        assert_eq!(stages[0].namespace, "default");
    }

    #[test]
    fn frozen_stages_are_dense_and_pending() {
        let def = parse(VALID_YAML.as_bytes()).unwrap();
        let stages = def.freeze_stages().unwrap();

        let indices: Vec<u32> = stages.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert!(stages.iter().all(|s| s.status == RunStatus::Pending));
        assert!(stages.iter().all(|s| s.namespace == "ci"));

        assert_eq!(stages[1].name, "test");
        assert_eq!(stages[1].artifacts, vec!["target/report.xml"]);
        assert_eq!(stages[1].vars["RUST_LOG"], "debug");
        assert_eq!(stages[1].secrets, vec!["test-credentials"]);
        assert_eq!(stages[2].spec.type_name(), "block");
        assert_eq!(stages[3].spec.type_name(), "deploy");
    }

    #[test]
    fn stage_ids_are_unique() {
        let def = parse(VALID_YAML.as_bytes()).unwrap();
        let stages = def.freeze_stages().unwrap();
        let mut ids: Vec<&str> = stages.iter().map(|s| s.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), stages.len());
    }

    #[test]
    fn stage_type_defaults_to_command() {
        let yaml = r#"
apiVersion: v1alpha1
kind: Pipeline
spec:
  template:
    stages:
      - name: test
        params:
          command: ["true"]
"#;
        let def = parse(yaml.as_bytes()).unwrap();
        assert_eq!(def.spec.template.stages[0].stage_type, "command");
    }

    #[test]
    fn spec_round_trips() {
        let parsed = parse(VALID_YAML.as_bytes()).unwrap();
        let serialized = parsed.to_yaml().unwrap();
        let reparsed = parse(serialized.as_bytes()).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
