use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::PipelineError;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Shared status vocabulary for builds and stages. Builds never enter
/// `Waiting`; that state belongs to block stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Fail,
    Waiting,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Waiting => "WAITING",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Typed stage parameters
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Per-type stage parameters. Unknown keys land in `extra` and survive
/// serialisation, so specs can carry forward-compatible fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageParams {
    Command {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default)]
        dependencies: Vec<String>,
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
    DockerBuild {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile_name: Option<String>,
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
    DockerPublish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_registry: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_image_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        require_credentials: Option<bool>,
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
    Deploy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deploy_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deploy_dir: Option<String>,
        #[serde(default = "default_true")]
        expose: bool,
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
    Block {
        #[serde(flatten)]
        extra: BTreeMap<String, serde_json::Value>,
    },
}

impl StageParams {
    /// Build typed params from a spec stage's `type` and free-form param map.
    pub fn from_spec(
        stage_type: &str,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, PipelineError> {
        let mut doc = serde_json::Map::new();
        doc.insert("type".into(), serde_json::json!(stage_type));
        for (key, value) in params {
            doc.insert(key.clone(), value.clone());
        }
        serde_json::from_value(serde_json::Value::Object(doc)).map_err(|e| {
            PipelineError::SpecInvalid(format!("stage params for type '{stage_type}': {e}"))
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::DockerBuild { .. } => "docker_build",
            Self::DockerPublish { .. } => "docker_publish",
            Self::Deploy { .. } => "deploy",
            Self::Block { .. } => "block",
        }
    }
}

// ---------------------------------------------------------------------------
// Stage record
// ---------------------------------------------------------------------------

/// One ordered unit of work within a build, frozen from the spec at build
/// creation. Later edits to the repo spec never touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    /// 1-based, dense within the build.
    pub index: u32,
    pub name: String,
    pub spec: StageParams,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub started_ns: i64,
    #[serde(default)]
    pub finished_ns: i64,
    #[serde(default)]
    pub workload_name: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub message: String,
    pub namespace: String,
}

/// Status callback body posted by workload agents (and the engine itself for
/// deploy stages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub timestamp_ns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus, timestamp_ns: i64) -> Self {
        Self {
            status,
            timestamp_ns,
            workload_name: None,
            pod_name: None,
            image: None,
            message: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition rules
// ---------------------------------------------------------------------------

/// What a requested transition amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    /// Duplicate delivery of a state already reached; absorbed silently.
    Noop,
    Illegal,
}

/// The stage state machine.
///
/// PENDING → RUNNING | WAITING | FAIL, RUNNING → SUCCESS | FAIL,
/// WAITING → RUNNING. Terminal states are immutable; duplicate updates of the
/// current state are no-ops.
pub fn classify_transition(from: RunStatus, to: RunStatus) -> Transition {
    use RunStatus::*;
    if from == to {
        return match from {
            Running | Success | Fail | Waiting => Transition::Noop,
            Pending => Transition::Illegal,
        };
    }
    match (from, to) {
        (Pending, Running) | (Pending, Waiting) => Transition::Apply,
        // a workload that could not even be dispatched fails from PENDING
        (Pending, Fail) => Transition::Apply,
        (Running, Success) | (Running, Fail) => Transition::Apply,
        (Waiting, Running) => Transition::Apply,
        _ => Transition::Illegal,
    }
}

impl Stage {
    pub fn ensure_transition(&self, to: RunStatus) -> Result<Transition, PipelineError> {
        match classify_transition(self.status, to) {
            Transition::Illegal => Err(PipelineError::IllegalTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            }),
            t => Ok(t),
        }
    }

    /// Record workload coordinates reported by a status callback.
    pub fn record_callback_details(&mut self, update: &StatusUpdate) {
        if let Some(name) = &update.workload_name {
            self.workload_name = name.clone();
        }
        if let Some(pod) = &update.pod_name {
            self.pod_name = pod.clone();
        }
        if let Some(image) = &update.image {
            self.image = image.clone();
        }
        if let Some(message) = &update.message {
            self.message = message.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(json: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(json).unwrap()
    }

    // -- typed params --

    #[test]
    fn command_params_from_spec() {
        let p = StageParams::from_spec(
            "command",
            &params(serde_json::json!({
                "command": ["sh", "-c", "exit 0"],
                "image": "busybox",
            })),
        )
        .unwrap();
        match &p {
            StageParams::Command { command, image, extra, .. } => {
                assert_eq!(command, &["sh", "-c", "exit 0"]);
                assert_eq!(image.as_deref(), Some("busybox"));
                assert!(extra.is_empty());
            }
            other => panic!("expected command params, got {other:?}"),
        }
        assert_eq!(p.type_name(), "command");
    }

    #[test]
    fn unknown_params_preserved_in_extra() {
        let p = StageParams::from_spec(
            "docker_build",
            &params(serde_json::json!({
                "dockerfile_path": "svc",
                "cache": true,
                "build_args": {"A": "1"},
            })),
        )
        .unwrap();
        let StageParams::DockerBuild { dockerfile_path, extra, .. } = &p else {
            panic!("expected docker_build params");
        };
        assert_eq!(dockerfile_path.as_deref(), Some("svc"));
        assert_eq!(extra["cache"], serde_json::json!(true));
        assert_eq!(extra["build_args"]["A"], serde_json::json!("1"));

        // extras survive a serialisation round trip
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["cache"], serde_json::json!(true));
        let back: StageParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn deploy_expose_defaults_to_true() {
        let p = StageParams::from_spec(
            "deploy",
            &params(serde_json::json!({"deploy_file": "k8s/app.yml"})),
        )
        .unwrap();
        let StageParams::Deploy { expose, deploy_file, .. } = p else {
            panic!("expected deploy params");
        };
        assert!(expose);
        assert_eq!(deploy_file.as_deref(), Some("k8s/app.yml"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = StageParams::from_spec("matrix", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PipelineError::SpecInvalid(_)));
    }

    // -- transitions --

    #[test]
    fn legal_transitions() {
        use RunStatus::*;
        assert_eq!(classify_transition(Pending, Running), Transition::Apply);
        assert_eq!(classify_transition(Pending, Waiting), Transition::Apply);
        assert_eq!(classify_transition(Pending, Fail), Transition::Apply);
        assert_eq!(classify_transition(Running, Success), Transition::Apply);
        assert_eq!(classify_transition(Running, Fail), Transition::Apply);
        assert_eq!(classify_transition(Waiting, Running), Transition::Apply);
    }

    #[test]
    fn duplicate_updates_are_noops() {
        use RunStatus::*;
        assert_eq!(classify_transition(Running, Running), Transition::Noop);
        assert_eq!(classify_transition(Success, Success), Transition::Noop);
        assert_eq!(classify_transition(Fail, Fail), Transition::Noop);
    }

    #[test]
    fn terminal_states_are_immutable() {
        use RunStatus::*;
        for to in [Pending, Running, Waiting, Fail] {
            assert_eq!(classify_transition(Success, to), Transition::Illegal, "SUCCESS -> {to}");
        }
        for to in [Pending, Running, Waiting, Success] {
            assert_eq!(classify_transition(Fail, to), Transition::Illegal, "FAIL -> {to}");
        }
    }

    #[test]
    fn skipping_straight_to_success_is_illegal() {
        assert_eq!(
            classify_transition(RunStatus::Pending, RunStatus::Success),
            Transition::Illegal
        );
        assert_eq!(
            classify_transition(RunStatus::Waiting, RunStatus::Success),
            Transition::Illegal
        );
    }

    #[test]
    fn status_serialises_screaming() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::from_str::<RunStatus>("\"FAIL\"").unwrap(),
            RunStatus::Fail
        );
    }
}
