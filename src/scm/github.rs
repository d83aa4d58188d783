use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use super::{
    AuthenticatedUser, CommitState, HookEvent, Repository, RepositoryEntry, ScmError, SourceHost,
    SourceHostProvider,
};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "gantry-ci";

/// Status context prefix; one context per stage index.
const STATUS_CONTEXT_PREFIX: &str = "gantry";

/// Token-scoped GitHub client.
pub struct GithubHost {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GithubHost {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            token: token.into(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ScmError> {
        let response = req
            .send()
            .await
            .map_err(|e| ScmError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(ScmError::Unauthorized),
            404 => Err(ScmError::NotFound(message)),
            code => Err(ScmError::Api { status: code, message }),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ScmError> {
        self.send(self.request(reqwest::Method::GET, path))
            .await?
            .json()
            .await
            .map_err(|e| ScmError::Request(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GhRepo {
    id: i64,
    name: String,
    full_name: String,
    clone_url: String,
    default_branch: String,
    owner: GhOwner,
    #[serde(default)]
    permissions: GhPermissions,
}

#[derive(Deserialize)]
struct GhOwner {
    login: String,
    #[serde(default)]
    avatar_url: String,
}

#[derive(Deserialize, Default)]
struct GhPermissions {
    #[serde(default)]
    admin: bool,
}

impl From<GhRepo> for Repository {
    fn from(r: GhRepo) -> Self {
        Self {
            id: r.id,
            owner: r.owner.login,
            name: r.name,
            full_name: r.full_name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
            avatar_url: r.owner.avatar_url,
            admin: r.permissions.admin,
        }
    }
}

#[derive(Deserialize)]
struct GhContent {
    #[serde(default)]
    content: String,
    sha: String,
}

#[derive(Deserialize)]
struct GhEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Deserialize)]
struct GhHook {
    #[serde(default)]
    config: GhHookConfig,
}

#[derive(Deserialize, Default)]
struct GhHookConfig {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct GhBranch {
    commit: GhBranchCommit,
}

#[derive(Deserialize)]
struct GhBranchCommit {
    sha: String,
}

#[derive(Deserialize)]
struct GhPull {
    number: u64,
}

#[derive(Deserialize)]
struct GhPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: GhPushRepo,
    #[serde(default)]
    head_commit: Option<GhPushCommit>,
    #[serde(default)]
    pusher: Option<GhPusher>,
}

#[derive(Deserialize)]
struct GhPushRepo {
    clone_url: String,
}

#[derive(Deserialize)]
struct GhPushCommit {
    #[serde(default)]
    author: Option<GhPushAuthor>,
}

#[derive(Deserialize)]
struct GhPushAuthor {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct GhPusher {
    #[serde(default)]
    name: String,
}

// ---------------------------------------------------------------------------
// SourceHost impl
// ---------------------------------------------------------------------------

#[async_trait]
impl SourceHost for GithubHost {
    fn name(&self) -> &'static str {
        "github"
    }

    fn access_token(&self) -> &str {
        &self.token
    }

    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository, ScmError> {
        let repo: GhRepo = self.get_json(&format!("/repos/{owner}/{repo}")).await?;
        Ok(repo.into())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, ScmError> {
        let repos: Vec<GhRepo> = self
            .get_json("/user/repos?sort=updated&direction=desc&per_page=100&type=all")
            .await?;
        Ok(repos.into_iter().map(Into::into).collect())
    }

    async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<u8>, ScmError> {
        let content: GhContent = self
            .get_json(&format!("/repos/{owner}/{repo}/contents/{path}?ref={reference}"))
            .await?;

        // GitHub base64-encodes file bodies with embedded newlines
        let compact: String = content
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64
            .decode(compact)
            .map_err(|e| ScmError::Request(format!("undecodable file content: {e}")))
    }

    async fn get_directory_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Vec<RepositoryEntry>, ScmError> {
        let entries: Vec<GhEntry> = self
            .get_json(&format!("/repos/{owner}/{repo}/contents/{path}?ref={reference}"))
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| RepositoryEntry {
                name: e.name,
                path: e.path,
                entry_type: e.entry_type,
            })
            .collect())
    }

    async fn create_hook(
        &self,
        owner: &str,
        repo: &str,
        callback_url: &str,
        events: &[String],
    ) -> Result<(), ScmError> {
        let payload = serde_json::json!({
            "name": "web",
            "active": true,
            "events": events,
            "config": {
                "url": callback_url,
                "content_type": "json",
            }
        });
        self.send(
            self.request(reqwest::Method::POST, &format!("/repos/{owner}/{repo}/hooks"))
                .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn hook_exists(&self, owner: &str, repo: &str, callback_url: &str) -> bool {
        let hooks: Vec<GhHook> = match self.get_json(&format!("/repos/{owner}/{repo}/hooks")).await
        {
            Ok(hooks) => hooks,
            Err(_) => return false,
        };
        hooks.iter().any(|h| h.config.url == callback_url)
    }

    async fn create_deploy_key(
        &self,
        owner: &str,
        repo: &str,
        public_key: &str,
        title: &str,
    ) -> Result<(), ScmError> {
        let payload = serde_json::json!({
            "title": title,
            "key": public_key,
            "read_only": true,
        });
        self.send(
            self.request(reqwest::Method::POST, &format!("/repos/{owner}/{repo}/keys"))
                .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        stage_index: u32,
        stage_name: &str,
        state: CommitState,
    ) -> Result<(), ScmError> {
        let payload = serde_json::json!({
            "state": state.as_str(),
            "description": stage_name,
            "context": format!("{STATUS_CONTEXT_PREFIX}:{stage_index}"),
        });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/statuses/{sha}"),
            )
            .json(&payload),
        )
        .await?;
        Ok(())
    }

    fn parse_hook_payload(&self, event: &str, payload: &[u8]) -> Result<HookEvent, ScmError> {
        if event != super::EVENT_PUSH {
            return Err(ScmError::MalformedHook(format!(
                "unsupported event type '{event}'"
            )));
        }

        let push: GhPushPayload = serde_json::from_slice(payload)
            .map_err(|e| ScmError::MalformedHook(e.to_string()))?;

        let branch = push
            .git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&push.git_ref)
            .to_owned();
        let author = push
            .head_commit
            .and_then(|c| c.author.map(|a| a.name))
            .filter(|name| !name.is_empty())
            .or_else(|| push.pusher.map(|p| p.name))
            .unwrap_or_default();

        Ok(HookEvent {
            author,
            branch,
            commit: push.after,
            clone_url: push.repository.clone_url,
            event: super::EVENT_PUSH.to_owned(),
        })
    }

    async fn get_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ScmError> {
        let branch: GhBranch = self
            .get_json(&format!("/repos/{owner}/{repo}/branches/{branch}"))
            .await?;
        Ok(branch.commit.sha)
    }

    async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<(), ScmError> {
        let payload = serde_json::json!({
            "ref": format!("refs/heads/{branch}"),
            "sha": from_sha,
        });
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/git/refs"),
            )
            .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<u64, ScmError> {
        let payload = serde_json::json!({
            "title": title,
            "head": head,
            "base": base,
            "body": body,
        });
        let pull: GhPull = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{owner}/{repo}/pulls"))
                    .json(&payload),
            )
            .await?
            .json()
            .await
            .map_err(|e| ScmError::Request(e.to_string()))?;
        Ok(pull.number)
    }

    async fn create_or_update_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        branch: &str,
        message: &str,
        content: &[u8],
        previous_sha: Option<&str>,
    ) -> Result<(), ScmError> {
        let mut payload = serde_json::json!({
            "message": message,
            "content": BASE64.encode(content),
            "branch": branch,
        });
        if let Some(sha) = previous_sha {
            payload["sha"] = serde_json::json!(sha);
        }
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/repos/{owner}/{repo}/contents/{path}"),
            )
            .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn get_file_sha(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        reference: &str,
    ) -> Result<Option<String>, ScmError> {
        match self
            .get_json::<GhContent>(&format!("/repos/{owner}/{repo}/contents/{path}?ref={reference}"))
            .await
        {
            Ok(content) => Ok(Some(content.sha)),
            Err(ScmError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider (OAuth login + token-scoped clients)
// ---------------------------------------------------------------------------

pub struct GithubProvider {
    http: reqwest::Client,
    api_base: String,
    oauth_base: String,
    client_id: String,
    client_secret: String,
}

impl GithubProvider {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.into(),
            oauth_base: "https://github.com".into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[derive(Deserialize)]
struct GhTokenResponse {
    #[serde(default)]
    access_token: String,
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
    #[serde(default)]
    avatar_url: String,
}

#[derive(Deserialize)]
struct GhEmail {
    email: String,
}

#[async_trait]
impl SourceHostProvider for GithubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn client(&self, access_token: &str) -> Arc<dyn SourceHost> {
        Arc::new(GithubHost::with_api_base(access_token, &self.api_base))
    }

    #[tracing::instrument(skip(self, code), err)]
    async fn exchange_code(
        &self,
        code: &str,
        state: &str,
    ) -> Result<AuthenticatedUser, ScmError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("state", state),
        ];
        let token: GhTokenResponse = self
            .http
            .post(format!("{}/login/oauth/access_token", self.oauth_base))
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .form(&params)
            .send()
            .await
            .map_err(|e| ScmError::Request(e.to_string()))?
            .json()
            .await
            .map_err(|e| ScmError::Request(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(ScmError::Unauthorized);
        }

        let host = GithubHost::with_api_base(&token.access_token, &self.api_base);
        let user: GhUser = host.get_json("/user").await?;
        let emails: Vec<GhEmail> = host.get_json("/user/emails").await.unwrap_or_default();

        Ok(AuthenticatedUser {
            login: user.login,
            access_token: token.access_token,
            emails: emails.into_iter().map(|e| e.email).collect(),
            avatar_url: user.avatar_url,
        })
    }
}
