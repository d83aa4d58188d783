pub mod kube;

use std::collections::BTreeMap;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("secret {name} not found in {namespace}")]
    SecretNotFound { namespace: String, name: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("cluster api error: {0}")]
    Api(String),
}

impl From<::kube::Error> for ClusterError {
    fn from(err: ::kube::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// One container of a stage workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadContainer {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Environment in its final composed order.
    pub env: Vec<(String, String)>,
    /// Volume names to mount; paths come from [`Workload::volumes`].
    pub mounts: Vec<String>,
}

/// A shared volume. `host_path == None` means scratch (emptyDir).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadVolume {
    pub name: String,
    pub mount_path: String,
    pub host_path: Option<String>,
}

/// Cluster-level execution unit for one stage: a job and its pod.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    /// `{pipeline, build, stage}` triple; applied to the job and the pod
    /// template so the log aggregator can locate pods by label.
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<WorkloadContainer>,
    pub volumes: Vec<WorkloadVolume>,
}

/// A resource accepted by [`Cluster::apply_manifest`].
#[derive(Debug, Clone)]
pub struct AppliedResource {
    pub kind: String,
    pub name: String,
}

/// Narrow capability interface over the Kubernetes API.
///
/// Everything the engine needs from the cluster and nothing more; tests swap
/// in a recording mock.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_workload(&self, workload: &Workload) -> Result<(), ClusterError>;

    /// Decoded key/value data of a named secret.
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError>;

    /// Pod names matching a `k=v[,k=v]` label selector.
    async fn list_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError>;

    async fn list_pod_containers(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, ClusterError>;

    async fn get_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError>;

    /// Server-side apply of a single manifest document.
    async fn apply_manifest(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<AppliedResource, ClusterError>;
}
