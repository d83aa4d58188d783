//! gantry-cli: thin command-line adapter over the HTTP API.
//!
//! Exit codes: 0 success, 1 validation or remote error, 2 missing
//! configuration.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gantry-cli")]
#[command(about = "Gantry CI/CD CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "GANTRY_API_URL", default_value = "http://localhost:3005")]
    api_url: String,

    /// API JWT (from `gantry-cli login`)
    #[arg(long, env = "GANTRY_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange a GitHub OAuth code for an API JWT
    Login {
        /// OAuth authorization code
        #[arg(long)]
        code: String,
        /// OAuth state parameter
        #[arg(long, default_value = "")]
        state: String,
    },
    /// Manage pipelines
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Manage builds
    Build {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Manage build stages
    Stage {
        #[command(subcommand)]
        command: StageCommands,
    },
    /// List repositories visible on the source host
    Repos,
    /// Scaffold a .pipeline.yml in the current directory
    Init,
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// List all pipelines
    List,
    /// Show one pipeline
    Get { owner: String, repo: String },
    /// Register a pipeline
    Create {
        owner: String,
        repo: String,
        /// Events to subscribe to (push is required)
        #[arg(long, default_value = "push")]
        events: Vec<String>,
    },
    /// Delete a pipeline and everything it owns
    Delete { owner: String, repo: String },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// List builds of a pipeline
    List { owner: String, repo: String },
    /// Show one build
    Get {
        owner: String,
        repo: String,
        number: u64,
    },
    /// Trigger a build of the default branch head
    Trigger {
        owner: String,
        repo: String,
        /// Recorded as the build author
        #[arg(long, default_value = "cli")]
        author: String,
    },
}

#[derive(Subcommand)]
enum StageCommands {
    /// List stages of a build
    List {
        owner: String,
        repo: String,
        number: u64,
    },
    /// Resume a waiting block stage
    Resume {
        owner: String,
        repo: String,
        number: u64,
        index: u32,
    },
    /// Fetch stage logs (live or archived)
    Logs {
        owner: String,
        repo: String,
        number: u64,
        index: u32,
    },
}

enum CliError {
    /// Required configuration is absent (exit 2).
    MissingConfig(String),
    /// Validation or remote failure (exit 1).
    Failed(String),
}

impl From<reqwest::Error> for CliError {
    fn from(err: reqwest::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Failed(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(1)
        }
        Err(CliError::MissingConfig(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let api = Api {
        base: cli.api_url.clone(),
        token: cli.token.clone(),
        http: reqwest::Client::new(),
    };

    match cli.command {
        Commands::Login { code, state } => {
            let body = serde_json::json!({"code": code, "state": state});
            let response = api.post_unauthenticated("/login/github", &body).await?;
            println!("{}", pretty(&response));
            Ok(())
        }
        Commands::Pipeline { command } => match command {
            PipelineCommands::List => api.get_and_print("/api/v1/pipelines").await,
            PipelineCommands::Get { owner, repo } => {
                api.get_and_print(&format!("/api/v1/pipelines/{owner}/{repo}")).await
            }
            PipelineCommands::Create { owner, repo, events } => {
                let body = serde_json::json!({
                    "owner": owner,
                    "repo": repo,
                    "events": events,
                });
                let response = api.post("/api/v1/pipelines", &body, &[]).await?;
                println!("{}", pretty(&response));
                Ok(())
            }
            PipelineCommands::Delete { owner, repo } => {
                api.delete(&format!("/api/v1/pipelines/{owner}/{repo}")).await?;
                println!("pipeline {owner}/{repo} deleted");
                Ok(())
            }
        },
        Commands::Build { command } => match command {
            BuildCommands::List { owner, repo } => {
                api.get_and_print(&format!("/api/v1/pipelines/{owner}/{repo}/builds")).await
            }
            BuildCommands::Get { owner, repo, number } => {
                api.get_and_print(&format!("/api/v1/pipelines/{owner}/{repo}/builds/{number}"))
                    .await
            }
            BuildCommands::Trigger { owner, repo, author } => {
                let body = serde_json::json!({"author": author});
                let response = api
                    .post(
                        &format!("/api/v1/pipelines/{owner}/{repo}/builds"),
                        &body,
                        &[("X-Custom-Event", "cli")],
                    )
                    .await?;
                println!("{}", pretty(&response));
                Ok(())
            }
        },
        Commands::Stage { command } => match command {
            StageCommands::List { owner, repo, number } => {
                api.get_and_print(&format!(
                    "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages"
                ))
                .await
            }
            StageCommands::Resume { owner, repo, number, index } => {
                let response = api
                    .post(
                        &format!(
                            "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}/run"
                        ),
                        &serde_json::json!({}),
                        &[],
                    )
                    .await?;
                println!("{}", pretty(&response));
                Ok(())
            }
            StageCommands::Logs { owner, repo, number, index } => {
                api.get_and_print(&format!(
                    "/api/v1/pipelines/{owner}/{repo}/builds/{number}/stages/{index}/logs"
                ))
                .await
            }
        },
        Commands::Repos => api.get_and_print("/api/v1/repositories").await,
        Commands::Init => init_spec(),
    }
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

struct Api {
    base: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Api {
    fn token(&self) -> Result<&str, CliError> {
        self.token.as_deref().ok_or_else(|| {
            CliError::MissingConfig("no API token; set GANTRY_TOKEN or pass --token".into())
        })
    }

    async fn get_and_print(&self, path: &str) -> Result<(), CliError> {
        let token = self.token()?;
        let response = self
            .http
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await?;
        let value = Self::read_json(response).await?;
        println!("{}", pretty(&value));
        Ok(())
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        headers: &[(&str, &str)],
    ) -> Result<serde_json::Value, CliError> {
        let token = self.token()?;
        let mut request = self
            .http
            .post(format!("{}{path}", self.base))
            .bearer_auth(token)
            .json(body);
        for &(name, value) in headers {
            request = request.header(name, value);
        }
        Self::read_json(request.send().await?).await
    }

    async fn post_unauthenticated(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, CliError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await?;
        Self::read_json(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), CliError> {
        let token = self.token()?;
        let response = self
            .http
            .delete(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CliError::Failed(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, CliError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CliError::Failed(format!("{status}: {body}")));
        }
        if body.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| CliError::Failed(format!("unparseable response: {e}")))
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

const SPEC_TEMPLATE: &str = r#"apiVersion: v1alpha1
kind: Pipeline
metadata:
  name: my-pipeline
  namespace: default
spec:
  template:
    stages:
      - name: build-image
        type: docker_build
      - name: test
        type: command
        params:
          command: ["sh", "-c", "make test"]
"#;

fn init_spec() -> Result<(), CliError> {
    let path = std::path::Path::new(".pipeline.yml");
    if path.exists() {
        return Err(CliError::Failed(".pipeline.yml already exists".into()));
    }
    std::fs::write(path, SPEC_TEMPLATE)
        .map_err(|e| CliError::Failed(format!("cannot write .pipeline.yml: {e}")))?;
    println!("created .pipeline.yml");
    Ok(())
}
