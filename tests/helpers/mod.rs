#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use gantry::auth::token;
use gantry::cluster::{AppliedResource, Cluster, ClusterError, Workload};
use gantry::config::Config;
use gantry::object::ArtifactStore;
use gantry::pipeline::user;
use gantry::scm::{
    AuthenticatedUser, CommitState, HookEvent, Repository, RepositoryEntry, ScmError, SourceHost,
    SourceHostProvider,
};
use gantry::store::memory::MemoryKv;
use gantry::store::AppState;

pub const JWT_SECRET: &str = "test-secret";

// ---------------------------------------------------------------------------
// Mock cluster
// ---------------------------------------------------------------------------

/// Records workload creates and manifest applies; serves canned secrets,
/// pods and logs.
#[derive(Default)]
pub struct MockCluster {
    pub workloads: Mutex<Vec<Workload>>,
    pub secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    pub pods_by_selector: Mutex<BTreeMap<String, Vec<String>>>,
    pub pod_containers: Mutex<BTreeMap<String, Vec<String>>>,
    pub container_logs: Mutex<BTreeMap<(String, String), String>>,
    pub applied: Mutex<Vec<(String, Value)>>,
    /// When set, every workload create fails with this message.
    pub fail_workloads: Mutex<Option<String>>,
}

impl MockCluster {
    pub fn workload_count(&self) -> usize {
        self.workloads.lock().unwrap().len()
    }

    pub fn last_workload(&self) -> Workload {
        self.workloads.lock().unwrap().last().cloned().expect("no workload created")
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.into(), name.into()), data);
    }
}

#[async_trait]
impl Cluster for MockCluster {
    async fn create_workload(&self, workload: &Workload) -> Result<(), ClusterError> {
        if let Some(message) = self.fail_workloads.lock().unwrap().clone() {
            return Err(ClusterError::Api(message));
        }
        self.workloads.lock().unwrap().push(workload.clone());
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| ClusterError::SecretNotFound {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
            })
    }

    async fn list_pods_by_label(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .pods_by_selector
            .lock()
            .unwrap()
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_pod_containers(
        &self,
        _namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .pod_containers
            .lock()
            .unwrap()
            .get(pod)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pod_log(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError> {
        Ok(self
            .container_logs
            .lock()
            .unwrap()
            .get(&(pod.to_owned(), container.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_manifest(
        &self,
        namespace: &str,
        manifest: &Value,
    ) -> Result<AppliedResource, ClusterError> {
        self.applied
            .lock()
            .unwrap()
            .push((namespace.to_owned(), manifest.clone()));
        Ok(AppliedResource {
            kind: manifest["kind"].as_str().unwrap_or("Unknown").to_owned(),
            name: manifest["metadata"]["name"]
                .as_str()
                .unwrap_or("unnamed")
                .to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Mock source host
// ---------------------------------------------------------------------------

/// One in-memory repository with mutable file contents and a status log.
pub struct MockHost {
    pub repo: Mutex<Repository>,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// `(sha, stage_index, state)` in post order.
    pub statuses: Mutex<Vec<(String, u32, String)>>,
    pub hooks: Mutex<Vec<String>>,
    pub deploy_keys: Mutex<Vec<String>>,
}

impl MockHost {
    pub fn new(owner: &str, repo: &str) -> Self {
        Self {
            repo: Mutex::new(Repository {
                id: 1,
                owner: owner.into(),
                name: repo.into(),
                full_name: format!("{owner}/{repo}"),
                clone_url: format!("https://github.test/{owner}/{repo}.git"),
                default_branch: "main".into(),
                avatar_url: String::new(),
                admin: true,
            }),
            files: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            deploy_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_owned(), content.as_bytes().to_vec());
    }

    pub fn statuses(&self) -> Vec<(String, u32, String)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceHost for MockHost {
    fn name(&self) -> &'static str {
        "github"
    }

    fn access_token(&self) -> &str {
        "mock-token"
    }

    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError> {
        let record = self.repo.lock().unwrap().clone();
        if record.owner == owner && record.name == repo {
            Ok(record)
        } else {
            Err(ScmError::NotFound(format!("{owner}/{repo}")))
        }
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, ScmError> {
        Ok(vec![self.repo.lock().unwrap().clone()])
    }

    async fn get_file_content(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<Vec<u8>, ScmError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ScmError::NotFound(path.to_owned()))
    }

    async fn get_directory_content(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<Vec<RepositoryEntry>, ScmError> {
        let prefix = format!("{path}/");
        let entries: Vec<RepositoryEntry> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| RepositoryEntry {
                name: k.rsplit('/').next().unwrap_or_default().to_owned(),
                path: k.clone(),
                entry_type: "file".into(),
            })
            .collect();
        if entries.is_empty() {
            return Err(ScmError::NotFound(path.to_owned()));
        }
        Ok(entries)
    }

    async fn create_hook(
        &self,
        _owner: &str,
        _repo: &str,
        callback_url: &str,
        _events: &[String],
    ) -> Result<(), ScmError> {
        self.hooks.lock().unwrap().push(callback_url.to_owned());
        Ok(())
    }

    async fn hook_exists(&self, _owner: &str, _repo: &str, callback_url: &str) -> bool {
        self.hooks.lock().unwrap().iter().any(|h| h == callback_url)
    }

    async fn create_deploy_key(
        &self,
        _owner: &str,
        _repo: &str,
        public_key: &str,
        _title: &str,
    ) -> Result<(), ScmError> {
        self.deploy_keys.lock().unwrap().push(public_key.to_owned());
        Ok(())
    }

    async fn create_status(
        &self,
        _owner: &str,
        _repo: &str,
        sha: &str,
        stage_index: u32,
        _stage_name: &str,
        state: CommitState,
    ) -> Result<(), ScmError> {
        self.statuses
            .lock()
            .unwrap()
            .push((sha.to_owned(), stage_index, state.as_str().to_owned()));
        Ok(())
    }

    fn parse_hook_payload(&self, event: &str, payload: &[u8]) -> Result<HookEvent, ScmError> {
        if event != "push" {
            return Err(ScmError::MalformedHook(format!("unsupported event '{event}'")));
        }
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| ScmError::MalformedHook(e.to_string()))?;
        Ok(HookEvent {
            author: value["author"].as_str().unwrap_or_default().to_owned(),
            branch: value["branch"].as_str().unwrap_or_default().to_owned(),
            commit: value["commit"].as_str().unwrap_or_default().to_owned(),
            clone_url: value["clone_url"].as_str().unwrap_or_default().to_owned(),
            event: "push".into(),
        })
    }

    async fn get_branch_head(
        &self,
        _owner: &str,
        _repo: &str,
        _branch: &str,
    ) -> Result<String, ScmError> {
        Ok("head-sha".into())
    }

    async fn create_branch(
        &self,
        _owner: &str,
        _repo: &str,
        _branch: &str,
        _from_sha: &str,
    ) -> Result<(), ScmError> {
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        _title: &str,
        _head: &str,
        _base: &str,
        _body: &str,
    ) -> Result<u64, ScmError> {
        Ok(1)
    }

    async fn create_or_update_file(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _branch: &str,
        _message: &str,
        content: &[u8],
        _previous_sha: Option<&str>,
    ) -> Result<(), ScmError> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_owned(), content.to_vec());
        Ok(())
    }

    async fn get_file_sha(
        &self,
        _owner: &str,
        _repo: &str,
        path: &str,
        _reference: &str,
    ) -> Result<Option<String>, ScmError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .contains_key(path)
            .then(|| "blob-sha".to_owned()))
    }
}

pub struct MockProvider {
    pub host: Arc<MockHost>,
}

#[async_trait]
impl SourceHostProvider for MockProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn client(&self, _access_token: &str) -> Arc<dyn SourceHost> {
        self.host.clone()
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _state: &str,
    ) -> Result<AuthenticatedUser, ScmError> {
        Ok(AuthenticatedUser {
            login: "alice".into(),
            access_token: "mock-token".into(),
            emails: vec!["alice@example.test".into()],
            avatar_url: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub state: AppState,
    pub app: Router,
    pub cluster: Arc<MockCluster>,
    pub host: Arc<MockHost>,
    /// JWT of the seeded user "alice".
    pub user_token: String,
}

fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:0".into(),
        database_url: String::new(),
        external_url: "http://gantry.test".into(),
        jwt_secret: JWT_SECRET.into(),
        github_client_id: String::new(),
        github_client_secret: String::new(),
        s3_endpoint: "http://minio.test:9000".into(),
        s3_bucket: "gantry".into(),
        s3_access_key: "test".into(),
        s3_secret_key: "test".into(),
        s3_region: "us-east-1".into(),
        internal_registry: "registry.test:5000".into(),
        agent_image: "ghcr.io/gantry-ci/agent:latest".into(),
        docker_agent_image: "ghcr.io/gantry-ci/docker-agent:latest".into(),
        command_agent_image: "ghcr.io/gantry-ci/command-agent:latest".into(),
    }
}

/// Fully in-memory `AppState` plus the API router: memory KV, memory object
/// store, mock cluster, mock source host, and a seeded user "alice".
pub async fn harness(owner: &str, repo: &str) -> Harness {
    let cluster = Arc::new(MockCluster::default());
    let host = Arc::new(MockHost::new(owner, repo));

    let state = AppState {
        kv: Arc::new(MemoryKv::new()),
        artifacts: ArtifactStore::in_memory(),
        cluster: cluster.clone(),
        scm: Arc::new(MockProvider { host: host.clone() }),
        config: Arc::new(test_config()),
    };

    let seeded = user::upsert_login(
        &state,
        "github",
        &AuthenticatedUser {
            login: "alice".into(),
            access_token: "mock-token".into(),
            emails: vec!["alice@example.test".into()],
            avatar_url: String::new(),
        },
    )
    .await
    .expect("seed user");

    let user_token =
        token::issue_login_token(JWT_SECRET, &seeded.id, &seeded.user).expect("login token");

    let app = gantry::api::router().with_state(state.clone());

    Harness {
        state,
        app,
        cluster,
        host,
        user_token,
    }
}

impl Harness {
    pub fn hook_token(&self, owner: &str, repo: &str) -> String {
        token::issue_hook_token(JWT_SECRET, owner, repo).expect("hook token")
    }

    /// Register the pipeline through the API, as a user would.
    pub async fn create_pipeline(&self, owner: &str, repo: &str) -> Value {
        let (status, body) = self
            .post_json(
                &self.user_token,
                "/api/v1/pipelines",
                serde_json::json!({"owner": owner, "repo": repo, "events": ["push"]}),
                &[],
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "pipeline create failed: {body}");
        body
    }

    /// Deliver a push webhook; returns the response `(status, body)`.
    pub async fn push(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        commit: &str,
    ) -> (StatusCode, Value) {
        let token = self.hook_token(owner, repo);
        self.post_json(
            &token,
            &format!("/api/v1/pipelines/{owner}/{repo}/builds"),
            serde_json::json!({
                "author": "alice",
                "branch": branch,
                "commit": commit,
                "clone_url": format!("https://github.test/{owner}/{repo}.git"),
            }),
            &[("X-Github-Event", "push")],
        )
        .await
    }

    /// Post a workload status callback.
    pub async fn stage_update(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        index: u32,
        status: &str,
        timestamp_ns: i64,
    ) -> (StatusCode, Value) {
        let token = self.hook_token(owner, repo);
        self.post_json(
            &token,
            &format!("/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}"),
            serde_json::json!({"status": status, "timestamp_ns": timestamp_ns}),
            &[],
        )
        .await
    }

    pub async fn get_json(&self, token: &str, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(
        &self,
        token: &str,
        path: &str,
        body: Value,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json");
        for &(name, value) in headers {
            builder = builder.header(name, value);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        self.send(request).await
    }

    pub async fn delete(&self, token: &str, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("DELETE")
            .uri(path)
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}
