use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, Pod, PodSpec, PodTemplateSpec,
    Secret, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;

use super::{AppliedResource, Cluster, ClusterError, Workload};

/// Production [`Cluster`] backed by the kube client.
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub async fn connect() -> Result<Self, ClusterError> {
        let client = kube::Client::try_default().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    #[tracing::instrument(skip(self, workload), fields(name = %workload.name, namespace = %workload.namespace), err)]
    async fn create_workload(&self, workload: &Workload) -> Result<(), ClusterError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &workload.namespace);
        jobs.create(&PostParams::default(), &build_job(workload))
            .await?;
        tracing::info!(job = %workload.name, "workload created");
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match secrets.get(name).await {
            Ok(s) => s,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(ClusterError::SecretNotFound {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut data = BTreeMap::new();
        for (key, value) in secret.data.unwrap_or_default() {
            data.insert(key, String::from_utf8_lossy(&value.0).into_owned());
        }
        Ok(data)
    }

    async fn list_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn list_pod_containers(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(pod).await?;
        Ok(pod
            .spec
            .map(|s| s.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }

    async fn get_pod_log(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_owned()),
            ..Default::default()
        };
        Ok(pods.logs(pod, &params).await?)
    }

    #[tracing::instrument(skip(self, manifest), fields(%namespace), err)]
    async fn apply_manifest(
        &self,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> Result<AppliedResource, ClusterError> {
        let (ar, obj) = api_resource_from_manifest(manifest)?;
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::InvalidManifest("missing metadata.name".into()))?
            .to_owned();

        // Per-resource namespace wins over the stage namespace
        let ns = obj.metadata.namespace.as_deref().unwrap_or(namespace);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);

        let patch_params = PatchParams::apply("gantry-deployer").force();
        api.patch(&name, &patch_params, &Patch::Apply(&obj)).await?;

        tracing::info!(kind = %ar.kind, %name, %ns, "resource applied");
        Ok(AppliedResource {
            kind: ar.kind.clone(),
            name,
        })
    }
}

fn build_job(workload: &Workload) -> Job {
    let containers = workload
        .containers
        .iter()
        .map(|c| Container {
            name: c.name.clone(),
            image: Some(c.image.clone()),
            image_pull_policy: Some("Always".into()),
            args: (!c.args.is_empty()).then(|| c.args.clone()),
            working_dir: c.working_dir.clone(),
            env: Some(
                c.env
                    .iter()
                    .map(|(k, v)| EnvVar {
                        name: k.clone(),
                        value: Some(v.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            volume_mounts: Some(
                c.mounts
                    .iter()
                    .filter_map(|name| {
                        workload.volumes.iter().find(|v| v.name == *name).map(|v| {
                            VolumeMount {
                                name: v.name.clone(),
                                mount_path: v.mount_path.clone(),
                                ..Default::default()
                            }
                        })
                    })
                    .collect(),
            ),
            ..Default::default()
        })
        .collect();

    let volumes = workload
        .volumes
        .iter()
        .map(|v| Volume {
            name: v.name.clone(),
            empty_dir: v.host_path.is_none().then(EmptyDirVolumeSource::default),
            host_path: v.host_path.as_ref().map(|path| HostPathVolumeSource {
                path: path.clone(),
                type_: None,
            }),
            ..Default::default()
        })
        .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(workload.name.clone()),
            namespace: Some(workload.namespace.clone()),
            labels: Some(workload.labels.clone()),
            annotations: (!workload.annotations.is_empty())
                .then(|| workload.annotations.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(workload.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".into()),
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Manifest → kube-rs DynamicObject helpers
// ---------------------------------------------------------------------------

fn api_resource_from_manifest(
    doc: &serde_json::Value,
) -> Result<(ApiResource, DynamicObject), ClusterError> {
    let api_version = doc["apiVersion"]
        .as_str()
        .ok_or_else(|| ClusterError::InvalidManifest("missing apiVersion".into()))?;
    let kind = doc["kind"]
        .as_str()
        .ok_or_else(|| ClusterError::InvalidManifest("missing kind".into()))?;

    let (group, version) = parse_api_version(api_version);
    let plural = kind_to_plural(kind);

    let ar = ApiResource {
        group: group.to_owned(),
        version: version.to_owned(),
        api_version: api_version.to_owned(),
        kind: kind.to_owned(),
        plural,
    };

    let obj: DynamicObject = serde_json::from_value(doc.clone())
        .map_err(|e| ClusterError::InvalidManifest(e.to_string()))?;

    Ok((ar, obj))
}

/// Parse "apps/v1" → ("apps", "v1"), "v1" → ("", "v1")
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Map a K8s kind to its plural resource name.
fn kind_to_plural(kind: &str) -> String {
    match kind {
        "Deployment" => "deployments".into(),
        "Service" => "services".into(),
        "ConfigMap" => "configmaps".into(),
        "Secret" => "secrets".into(),
        "Ingress" => "ingresses".into(),
        "ServiceAccount" => "serviceaccounts".into(),
        "Namespace" => "namespaces".into(),
        "Job" => "jobs".into(),
        "CronJob" => "cronjobs".into(),
        "StatefulSet" => "statefulsets".into(),
        "DaemonSet" => "daemonsets".into(),
        "PersistentVolumeClaim" => "persistentvolumeclaims".into(),
        "HorizontalPodAutoscaler" => "horizontalpodautoscalers".into(),
        // Fallback: lowercase + "s" (works for most standard resources)
        other => format!("{}s", other.to_lowercase()),
    }
}
