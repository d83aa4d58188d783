//! Renders a stage into a concrete cluster workload.
//!
//! Every workload carries an agent sidecar (clones the source at the build's
//! commit, uploads artifacts, reports status) plus a type-specific worker
//! container, sharing the `source`, `status` and `docker-sock` volumes.

use std::collections::BTreeMap;

use crate::cluster::{Workload, WorkloadContainer, WorkloadVolume};
use crate::config::Config;
use crate::store::paths;

use super::build::Build;
use super::registry::Pipeline;
use super::stage::{Stage, StageParams};

pub const SOURCE_MOUNT: &str = "/gantry/src";
pub const STATUS_MOUNT: &str = "/gantry/status";
pub const DOCKER_SOCK: &str = "/var/run/docker.sock";

pub struct RunContext<'a> {
    pub config: &'a Config,
    pub pipeline: &'a Pipeline,
    pub build: &'a Build,
    pub stage: &'a Stage,
    /// Key/value pairs resolved from the union of pipeline and stage secrets.
    pub secrets: &'a BTreeMap<String, String>,
    pub access_token: &'a str,
    pub hook_token: &'a str,
}

/// Render the workload for a stage. Pure: all cluster and store I/O happens
/// before this call.
pub fn render(ctx: &RunContext<'_>) -> Workload {
    let name = workload_name(ctx);
    let labels = BTreeMap::from([
        ("pipeline".to_owned(), ctx.pipeline.id.clone()),
        ("build".to_owned(), ctx.build.number.to_string()),
        ("stage".to_owned(), ctx.stage.index.to_string()),
    ]);

    let mut annotations = BTreeMap::new();
    if !ctx.stage.artifacts.is_empty() {
        annotations.insert("gantry/artifacts".to_owned(), ctx.stage.artifacts.join(" "));
    }

    let volumes = vec![
        WorkloadVolume {
            name: "source".into(),
            mount_path: SOURCE_MOUNT.into(),
            host_path: None,
        },
        WorkloadVolume {
            name: "status".into(),
            mount_path: STATUS_MOUNT.into(),
            host_path: None,
        },
        WorkloadVolume {
            name: "docker-sock".into(),
            mount_path: DOCKER_SOCK.into(),
            host_path: Some(DOCKER_SOCK.into()),
        },
    ];
    let mounts: Vec<String> = volumes.iter().map(|v| v.name.clone()).collect();

    let containers = vec![
        agent_container(ctx, mounts.clone()),
        worker_container(ctx, mounts),
    ];

    Workload {
        name,
        namespace: ctx.stage.namespace.clone(),
        labels,
        annotations,
        containers,
        volumes,
    }
}

pub fn workload_name(ctx: &RunContext<'_>) -> String {
    format!(
        "{}-{}-{}",
        ctx.pipeline.id, ctx.build.number, ctx.stage.index
    )
}

/// Engine-injected environment, the base layer of the composition order.
fn base_env(ctx: &RunContext<'_>) -> BTreeMap<String, String> {
    let artifact_url = format!(
        "{}/{}/{}",
        ctx.config.s3_endpoint,
        ctx.config.s3_bucket,
        paths::stage_artifacts(&ctx.pipeline.id, ctx.build.number, ctx.stage.index),
    );
    BTreeMap::from([
        ("RUN_PIPELINE_ID".to_owned(), ctx.pipeline.id.clone()),
        ("RUN_BUILD_ID".to_owned(), ctx.build.number.to_string()),
        ("RUN_STAGE_ID".to_owned(), ctx.stage.index.to_string()),
        ("RUN_COMMIT".to_owned(), ctx.build.commit.clone()),
        ("RUN_BRANCH".to_owned(), ctx.build.branch.clone()),
        ("RUN_NAMESPACE".to_owned(), ctx.stage.namespace.clone()),
        (
            "RUN_INTERNAL_REGISTRY".to_owned(),
            ctx.config.internal_registry.clone(),
        ),
        ("RUN_URL".to_owned(), ctx.config.external_url.clone()),
        ("RUN_ARTIFACT_URL".to_owned(), artifact_url),
    ])
}

/// Composition order, later overrides earlier: engine-injected, resolved
/// secrets, pipeline vars, stage vars.
fn composed_env(ctx: &RunContext<'_>) -> BTreeMap<String, String> {
    let mut env = base_env(ctx);
    env.extend(ctx.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(ctx.pipeline.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(ctx.stage.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn agent_container(ctx: &RunContext<'_>, mounts: Vec<String>) -> WorkloadContainer {
    let mut env = composed_env(ctx);
    env.insert("REQUIRE_SOURCE_CODE".into(), "TRUE".into());
    env.insert("GIT_COMMIT".into(), ctx.build.commit.clone());
    env.insert("GIT_CLONE_URL".into(), ctx.build.clone_url.clone());
    env.insert("GIT_OWNER".into(), ctx.pipeline.owner.clone());
    env.insert("GIT_REPO".into(), ctx.pipeline.repo.clone());
    env.insert("GIT_TOKEN".into(), ctx.access_token.to_owned());
    env.insert("RUN_TOKEN".into(), ctx.hook_token.to_owned());
    env.insert("S3_URL".into(), ctx.config.s3_endpoint.clone());
    env.insert("S3_BUCKET".into(), ctx.config.s3_bucket.clone());
    env.insert("S3_ACCESS_KEY".into(), ctx.config.s3_access_key.clone());
    env.insert("S3_SECRET_KEY".into(), ctx.config.s3_secret_key.clone());
    if !ctx.stage.artifacts.is_empty() {
        env.insert("ARTIFACTS".into(), ctx.stage.artifacts.join(" "));
    }

    WorkloadContainer {
        name: "gantry-agent".into(),
        image: ctx.config.agent_image.clone(),
        args: vec![],
        working_dir: None,
        env: env.into_iter().collect(),
        mounts,
    }
}

fn worker_container(ctx: &RunContext<'_>, mounts: Vec<String>) -> WorkloadContainer {
    match &ctx.stage.spec {
        StageParams::DockerBuild {
            dockerfile_path,
            dockerfile_name,
            extra,
        } => {
            let mut env = composed_env(ctx);
            env.insert("MODE".into(), "BUILD".into());
            env.insert(
                "IMAGE_NAME".into(),
                format!("{}-{}", ctx.pipeline.id, ctx.build.number),
            );
            env.insert("IMAGE_TAG".into(), ctx.build.commit.clone());
            env.insert(
                "INTERNAL_REGISTRY".into(),
                ctx.config.internal_registry.clone(),
            );
            env.insert(
                "DOCKERFILE_PATH".into(),
                dockerfile_path.clone().unwrap_or_else(|| ".".into()),
            );
            env.insert(
                "DOCKERFILE_NAME".into(),
                dockerfile_name.clone().unwrap_or_else(|| "Dockerfile".into()),
            );
            env.insert("REQUIRE_CREDENTIALS".into(), "TRUE".into());
            extend_uppercased(&mut env, extra);

            WorkloadContainer {
                name: "docker-agent".into(),
                image: ctx.config.docker_agent_image.clone(),
                args: vec![],
                working_dir: None,
                env: env.into_iter().collect(),
                mounts,
            }
        }
        StageParams::DockerPublish {
            external_registry,
            external_image_name,
            require_credentials,
            extra,
        } => {
            let mut env = composed_env(ctx);
            env.insert("MODE".into(), "PUBLISH".into());
            env.insert(
                "IMAGE_NAME".into(),
                format!("{}-{}", ctx.pipeline.id, ctx.build.number),
            );
            env.insert("IMAGE_TAG".into(), ctx.build.commit.clone());
            env.insert(
                "INTERNAL_REGISTRY".into(),
                ctx.config.internal_registry.clone(),
            );
            if let Some(registry) = external_registry {
                env.insert("EXTERNAL_REGISTRY".into(), registry.clone());
            }
            if let Some(image) = external_image_name {
                env.insert("EXTERNAL_IMAGE_NAME".into(), image.clone());
            }
            env.insert(
                "REQUIRE_CREDENTIALS".into(),
                if require_credentials.unwrap_or(true) {
                    "TRUE".into()
                } else {
                    "FALSE".into()
                },
            );
            extend_uppercased(&mut env, extra);

            WorkloadContainer {
                name: "docker-agent".into(),
                image: ctx.config.docker_agent_image.clone(),
                args: vec![],
                working_dir: None,
                env: env.into_iter().collect(),
                mounts,
            }
        }
        StageParams::Command {
            command,
            args,
            image,
            working_dir,
            dependencies,
            extra,
        } => command_worker(
            ctx,
            mounts,
            command,
            args,
            image.as_deref(),
            working_dir.as_deref(),
            dependencies,
            extra,
        ),
        // block stages only reach here on resume, where they run with
        // command semantics
        StageParams::Block { extra } => {
            command_worker(ctx, mounts, &[], &[], None, None, &[], extra)
        }
        // deploy stages are executed by the engine and never get a workload
        StageParams::Deploy { .. } => unreachable!("deploy stages do not render workloads"),
    }
}

#[allow(clippy::too_many_arguments)]
fn command_worker(
    ctx: &RunContext<'_>,
    mounts: Vec<String>,
    command: &[String],
    args: &[String],
    image: Option<&str>,
    working_dir: Option<&str>,
    dependencies: &[String],
    extra: &BTreeMap<String, serde_json::Value>,
) -> WorkloadContainer {
    let mut env = composed_env(ctx);

    // default image: the internal-registry image a prior docker_build pushed
    let run_image = image.map(str::to_owned).unwrap_or_else(|| {
        format!(
            "{}/{}-{}:{}",
            ctx.config.internal_registry, ctx.pipeline.id, ctx.build.number, ctx.build.commit
        )
    });
    env.insert("IMAGE".into(), run_image);

    if !command.is_empty() {
        env.insert("COMMAND".into(), command.join(" "));
    }
    let workdir = working_dir.unwrap_or(SOURCE_MOUNT).to_owned();
    env.insert("WORKING_DIR".into(), workdir.clone());
    if !dependencies.is_empty() {
        env.insert("DEPENDENCIES".into(), dependencies.join(" "));
    }
    extend_uppercased(&mut env, extra);

    // the worker propagates exactly this set into the spawned container
    let keys: Vec<&str> = env.keys().map(String::as_str).collect();
    let env_keys = keys.join(" ");
    env.insert("ENV_KEYS".into(), env_keys);

    WorkloadContainer {
        name: "command-agent".into(),
        image: ctx.config.command_agent_image.clone(),
        args: args.to_vec(),
        working_dir: Some(workdir),
        env: env.into_iter().collect(),
        mounts,
    }
}

/// Lower remaining free-form params to `UPPER_CASE` env vars.
fn extend_uppercased(
    env: &mut BTreeMap<String, String>,
    extra: &BTreeMap<String, serde_json::Value>,
) {
    for (key, value) in extra {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.insert(key.to_uppercase(), rendered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::RunStatus;

    fn config() -> Config {
        Config {
            listen: "127.0.0.1:0".into(),
            database_url: String::new(),
            external_url: "http://gantry.test".into(),
            jwt_secret: "secret".into(),
            github_client_id: String::new(),
            github_client_secret: String::new(),
            s3_endpoint: "http://minio.test:9000".into(),
            s3_bucket: "gantry".into(),
            s3_access_key: "ak".into(),
            s3_secret_key: "sk".into(),
            s3_region: "us-east-1".into(),
            internal_registry: "registry.test:5000".into(),
            agent_image: "ghcr.io/gantry-ci/agent:latest".into(),
            docker_agent_image: "ghcr.io/gantry-ci/docker-agent:latest".into(),
            command_agent_image: "ghcr.io/gantry-ci/command-agent:latest".into(),
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline {
            id: "p1".into(),
            owner: "acme".into(),
            repo: "web".into(),
            source: "github".into(),
            login: "alice".into(),
            events: vec!["push".into()],
            keys: Default::default(),
            notifiers: vec![],
            secrets: vec![],
            vars: BTreeMap::from([("REGION".into(), "eu".into())]),
        }
    }

    fn build() -> Build {
        Build {
            id: "b-uuid".into(),
            number: 7,
            status: RunStatus::Running,
            commit: "abc123".into(),
            branch: "main".into(),
            author: "alice".into(),
            event: "push".into(),
            clone_url: "https://github.com/acme/web.git".into(),
            created_ns: 0,
            started_ns: 0,
            finished_ns: 0,
            current_stage: 1,
        }
    }

    fn stage(spec: StageParams) -> Stage {
        Stage {
            id: "s-uuid".into(),
            index: 2,
            name: "work".into(),
            spec,
            labels: BTreeMap::new(),
            vars: BTreeMap::from([("STAGE_VAR".into(), "stage".into())]),
            secrets: vec![],
            artifacts: vec!["out/*.tgz".into()],
            status: RunStatus::Pending,
            started_ns: 0,
            finished_ns: 0,
            workload_name: String::new(),
            pod_name: String::new(),
            image: String::new(),
            message: String::new(),
            namespace: "ci".into(),
        }
    }

    fn env_map(container: &WorkloadContainer) -> BTreeMap<String, String> {
        container.env.iter().cloned().collect()
    }

    fn render_with(spec: StageParams, secrets: BTreeMap<String, String>) -> Workload {
        let config = config();
        let pipeline = pipeline();
        let build = build();
        let stage = stage(spec);
        render(&RunContext {
            config: &config,
            pipeline: &pipeline,
            build: &build,
            stage: &stage,
            secrets: &secrets,
            access_token: "gh-token",
            hook_token: "hook-jwt",
        })
    }

    fn command_spec() -> StageParams {
        StageParams::Command {
            command: vec!["make".into(), "test".into()],
            args: vec!["-v".into()],
            image: None,
            working_dir: None,
            dependencies: vec!["postgres".into(), "redis".into()],
            extra: BTreeMap::from([("timeout".into(), serde_json::json!(600))]),
        }
    }

    #[test]
    fn workload_identity_and_labels() {
        let w = render_with(command_spec(), BTreeMap::new());
        assert_eq!(w.name, "p1-7-2");
        assert_eq!(w.namespace, "ci");
        assert_eq!(w.labels["pipeline"], "p1");
        assert_eq!(w.labels["build"], "7");
        assert_eq!(w.labels["stage"], "2");
        assert_eq!(w.annotations["gantry/artifacts"], "out/*.tgz");
    }

    #[test]
    fn workload_has_agent_and_worker_sharing_volumes() {
        let w = render_with(command_spec(), BTreeMap::new());
        assert_eq!(w.containers.len(), 2);
        assert_eq!(w.containers[0].name, "gantry-agent");
        assert_eq!(w.containers[1].name, "command-agent");

        let names: Vec<&str> = w.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["source", "status", "docker-sock"]);
        assert_eq!(w.volumes[2].host_path.as_deref(), Some(DOCKER_SOCK));
        for container in &w.containers {
            assert_eq!(container.mounts, names);
        }
    }

    #[test]
    fn engine_injected_env_present_on_both_containers() {
        let w = render_with(command_spec(), BTreeMap::new());
        for container in &w.containers {
            let env = env_map(container);
            assert_eq!(env["RUN_PIPELINE_ID"], "p1");
            assert_eq!(env["RUN_BUILD_ID"], "7");
            assert_eq!(env["RUN_STAGE_ID"], "2");
            assert_eq!(env["RUN_COMMIT"], "abc123");
            assert_eq!(env["RUN_BRANCH"], "main");
            assert_eq!(env["RUN_NAMESPACE"], "ci");
            assert_eq!(env["RUN_INTERNAL_REGISTRY"], "registry.test:5000");
            assert_eq!(env["RUN_URL"], "http://gantry.test");
            assert!(env["RUN_ARTIFACT_URL"].contains("pipelines/p1/builds/7/stages/2/artifacts/"));
        }
    }

    #[test]
    fn agent_carries_clone_and_upload_credentials() {
        let w = render_with(command_spec(), BTreeMap::new());
        let env = env_map(&w.containers[0]);
        assert_eq!(env["GIT_COMMIT"], "abc123");
        assert_eq!(env["GIT_OWNER"], "acme");
        assert_eq!(env["GIT_REPO"], "web");
        assert_eq!(env["GIT_TOKEN"], "gh-token");
        assert_eq!(env["RUN_TOKEN"], "hook-jwt");
        assert_eq!(env["S3_BUCKET"], "gantry");
        assert_eq!(env["ARTIFACTS"], "out/*.tgz");
    }

    #[test]
    fn env_composition_order_secrets_then_vars() {
        // a var with the same name as a secret wins; both override base env
        let secrets = BTreeMap::from([
            ("DB_PASSWORD".into(), "from-secret".into()),
            ("REGION".into(), "from-secret".into()),
        ]);
        let w = render_with(command_spec(), secrets);
        let env = env_map(&w.containers[1]);
        assert_eq!(env["DB_PASSWORD"], "from-secret");
        // pipeline var overrides the secret
        assert_eq!(env["REGION"], "eu");
        assert_eq!(env["STAGE_VAR"], "stage");
    }

    #[test]
    fn command_worker_env_and_keys() {
        let w = render_with(command_spec(), BTreeMap::new());
        let worker = &w.containers[1];
        let env = env_map(worker);

        assert_eq!(env["IMAGE"], "registry.test:5000/p1-7:abc123");
        assert_eq!(env["COMMAND"], "make test");
        assert_eq!(env["WORKING_DIR"], SOURCE_MOUNT);
        assert_eq!(env["DEPENDENCIES"], "postgres redis");
        assert_eq!(env["TIMEOUT"], "600");
        assert_eq!(worker.args, vec!["-v"]);
        assert_eq!(worker.working_dir.as_deref(), Some(SOURCE_MOUNT));

        // ENV_KEYS lists every other env name
        let keys: Vec<&str> = env["ENV_KEYS"].split(' ').collect();
        assert!(keys.contains(&"IMAGE"));
        assert!(keys.contains(&"RUN_COMMIT"));
        assert!(!keys.contains(&"ENV_KEYS"));
        assert_eq!(keys.len(), env.len() - 1);
    }

    #[test]
    fn command_image_param_overrides_internal_registry() {
        let spec = StageParams::Command {
            command: vec!["true".into()],
            args: vec![],
            image: Some("busybox".into()),
            working_dir: Some("/work".into()),
            dependencies: vec![],
            extra: BTreeMap::new(),
        };
        let w = render_with(spec, BTreeMap::new());
        let env = env_map(&w.containers[1]);
        assert_eq!(env["IMAGE"], "busybox");
        assert_eq!(env["WORKING_DIR"], "/work");
    }

    #[test]
    fn docker_build_worker_env() {
        let spec = StageParams::DockerBuild {
            dockerfile_path: Some("svc".into()),
            dockerfile_name: None,
            extra: BTreeMap::from([("no_cache".into(), serde_json::json!(true))]),
        };
        let w = render_with(spec, BTreeMap::new());
        let worker = &w.containers[1];
        assert_eq!(worker.name, "docker-agent");
        let env = env_map(worker);
        assert_eq!(env["MODE"], "BUILD");
        assert_eq!(env["IMAGE_NAME"], "p1-7");
        assert_eq!(env["IMAGE_TAG"], "abc123");
        assert_eq!(env["DOCKERFILE_PATH"], "svc");
        assert_eq!(env["DOCKERFILE_NAME"], "Dockerfile");
        assert_eq!(env["NO_CACHE"], "true");
    }

    #[test]
    fn docker_publish_worker_env() {
        let spec = StageParams::DockerPublish {
            external_registry: Some("docker.io/acme".into()),
            external_image_name: Some("web".into()),
            require_credentials: Some(false),
            extra: BTreeMap::new(),
        };
        let w = render_with(spec, BTreeMap::new());
        let env = env_map(&w.containers[1]);
        assert_eq!(env["MODE"], "PUBLISH");
        assert_eq!(env["EXTERNAL_REGISTRY"], "docker.io/acme");
        assert_eq!(env["EXTERNAL_IMAGE_NAME"], "web");
        assert_eq!(env["REQUIRE_CREDENTIALS"], "FALSE");
    }

    #[test]
    fn resumed_block_stage_renders_command_worker() {
        let spec = StageParams::Block {
            extra: BTreeMap::new(),
        };
        let w = render_with(spec, BTreeMap::new());
        assert_eq!(w.containers[1].name, "command-agent");
        let env = env_map(&w.containers[1]);
        assert_eq!(env["IMAGE"], "registry.test:5000/p1-7:abc123");
    }
}
