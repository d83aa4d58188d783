pub mod github;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// Event kinds recognised on the build-trigger endpoint.
pub const EVENT_PUSH: &str = "push";
pub const EVENT_PING: &str = "ping";
pub const EVENT_DASHBOARD: &str = "dashboard";
pub const EVENT_CLI: &str = "cli";

#[derive(Debug, thiserror::Error)]
pub enum ScmError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized against source host")]
    Unauthorized,

    #[error("malformed hook payload: {0}")]
    MalformedHook(String),

    #[error("source host request failed: {0}")]
    Request(String),

    #[error("source host rejected the call ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Common repository details from the source host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    #[serde(default)]
    pub avatar_url: String,
    /// Whether the scoped user has admin rights on the repository.
    #[serde(default)]
    pub admin: bool,
}

/// One entry of a repository directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub name: String,
    pub path: String,
    /// "file" or "dir".
    pub entry_type: String,
}

/// Details extracted from an incoming hook delivery or a custom trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub author: String,
    pub branch: String,
    pub commit: String,
    pub clone_url: String,
    pub event: String,
}

/// Commit status states understood by source hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Error,
    Failure,
}

impl CommitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Failure => "failure",
        }
    }
}

/// User identity returned from an OAuth login exchange.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub login: String,
    pub access_token: String,
    pub emails: Vec<String>,
    pub avatar_url: String,
}

/// Capability set the engine requires from a source-code host.
///
/// Implementations are scoped to one access token; [`SourceHostProvider`]
/// hands them out per request.
#[async_trait]
pub trait SourceHost: Send + Sync {
    fn name(&self) -> &'static str;

    /// Token this client is scoped to; forwarded to workload agents so they
    /// can clone the repository.
    fn access_token(&self) -> &str;

    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError>;

    async fn list_repositories(&self) -> Result<Vec<Repository>, ScmError>;

    /// Raw file content at a commit or branch ref.
    async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, ScmError>;

    async fn get_directory_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<RepositoryEntry>, ScmError>;

    async fn create_hook(
        &self,
        owner: &str,
        repo: &str,
        callback_url: &str,
        events: &[String],
    ) -> Result<(), ScmError>;

    async fn hook_exists(&self, owner: &str, repo: &str, callback_url: &str) -> bool;

    async fn create_deploy_key(
        &self,
        owner: &str,
        repo: &str,
        public_key: &str,
        title: &str,
    ) -> Result<(), ScmError>;

    /// Post a per-stage commit status; context is `gantry:<stage index>`.
    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        stage_index: u32,
        stage_name: &str,
        state: CommitState,
    ) -> Result<(), ScmError>;

    /// Translate a raw webhook delivery into a [`HookEvent`].
    fn parse_hook_payload(&self, event: &str, payload: &[u8]) -> Result<HookEvent, ScmError>;

    async fn get_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ScmError>;

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<(), ScmError>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<u64, ScmError>;

    /// Create the file at `path`, or update it when `previous_sha` is given.
    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        content: &[u8],
        previous_sha: Option<&str>,
    ) -> Result<(), ScmError>;

    /// Blob sha of `path` at `reference`, used for spec-file updates.
    async fn get_file_sha(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<String>, ScmError>;
}

/// Hands out token-scoped [`SourceHost`] clients and performs OAuth logins.
#[async_trait]
pub trait SourceHostProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn client(&self, access_token: &str) -> Arc<dyn SourceHost>;

    /// Exchange an OAuth authorization code for an authenticated user.
    async fn exchange_code(&self, code: &str, state: &str)
    -> Result<AuthenticatedUser, ScmError>;
}
