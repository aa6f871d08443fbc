//! Per-node artifact distribution jobs.
//!
//! Each node gets exactly one job that copies binaries, images and charts
//! into its local data dir. Jobs are never patched: when the owning
//! installation or the artifact locations change, the job is deleted and
//! created again so the copy always runs against current inputs.

use std::collections::BTreeMap;

use base64::Engine as _;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use outpost_core::{content_hash, name_with_length_limit, Error, Installation, Result, MAX_NAME_LEN};
use outpost_kubehub::Cluster;
use tracing::{debug, info};

pub const JOB_PREFIX: &str = "copy-artifacts-";
pub const INSTALLATION_ANNOTATION: &str = "outpost.io/installation";
pub const HASH_ANNOTATION: &str = "outpost.io/artifacts-config-hash";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

#[derive(Debug, Clone)]
pub struct ArtifactsJobConfig {
    pub namespace: String,
    /// Distribution tool image.
    pub image: String,
    /// Node-local data directory the artifacts land in.
    pub data_dir: String,
    pub pull_secret: String,
}

impl ArtifactsJobConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            namespace: std::env::var("OUTPOST_NAMESPACE").unwrap_or_else(|_| "outpost-system".to_string()),
            image: image.into(),
            data_dir: std::env::var("OUTPOST_DATA_DIR").unwrap_or_else(|_| "/var/lib/outpost".to_string()),
            pull_secret: "registry-creds".to_string(),
        }
    }
}

pub fn job_name_for_node(node: &str) -> String {
    name_with_length_limit(JOB_PREFIX, node, MAX_NAME_LEN)
}

/// Hash of the artifact locations, or `None` when there is nothing to copy.
pub fn artifacts_hash(inst: &Installation) -> Result<Option<String>> {
    match &inst.spec.artifacts {
        None => Ok(None),
        Some(loc) => content_hash(loc).map(Some).map_err(|e| Error::InvalidConfig(format!("hashing artifact locations: {}", e))),
    }
}

/// A job is current when it was made for this installation and these
/// artifact locations.
pub fn job_is_current(job: &Job, installation: &str, hash: &str) -> bool {
    let ann = job.metadata.annotations.as_ref();
    let get = |k: &str| ann.and_then(|a| a.get(k)).map(String::as_str);
    get(INSTALLATION_ANNOTATION) == Some(installation) && get(HASH_ANNOTATION) == Some(hash)
}

/// Build the distribution job for `node`.
pub fn build_job(inst: &Installation, node: &str, hash: &str, cfg: &ArtifactsJobConfig) -> Result<Job> {
    let snapshot = serde_json::to_vec(inst).map_err(|e| Error::InvalidConfig(format!("serializing installation: {}", e)))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(snapshot);

    let annotations = BTreeMap::from([
        (INSTALLATION_ANNOTATION.to_string(), inst.display_name()),
        (HASH_ANNOTATION.to_string(), hash.to_string()),
    ]);
    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "outpost-artifacts".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "outpost".to_string()),
    ]);

    let container = Container {
        name: "copy-artifacts".into(),
        image: Some(cfg.image.clone()),
        command: Some(vec!["/usr/local/bin/outpost-artifact-mirror".into()]),
        args: Some(vec!["pull".into(), "--data-dir".into(), cfg.data_dir.clone(), "$(INSTALLATION_DATA)".into()]),
        env: Some(vec![EnvVar { name: "INSTALLATION_DATA".into(), value: Some(encoded), ..Default::default() }]),
        volume_mounts: Some(vec![VolumeMount { name: "host".into(), mount_path: cfg.data_dir.clone(), ..Default::default() }]),
        ..Default::default()
    };

    let pod = PodSpec {
        node_selector: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())])),
        restart_policy: Some("OnFailure".into()),
        image_pull_secrets: Some(vec![LocalObjectReference { name: Some(cfg.pull_secret.clone()) }]),
        // control-plane nodes need their artifacts too
        tolerations: Some(vec![Toleration { operator: Some("Exists".into()), ..Default::default() }]),
        volumes: Some(vec![Volume {
            name: "host".into(),
            host_path: Some(HostPathVolumeSource { path: cfg.data_dir.clone(), type_: Some("DirectoryOrCreate".into()) }),
            ..Default::default()
        }]),
        containers: vec![container],
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(job_name_for_node(node)),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            owner_references: inst.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

async fn node_names(cluster: &dyn Cluster) -> Result<Vec<String>> {
    let nodes = cluster.list_nodes().await.map_err(Error::Cluster)?;
    Ok(nodes.into_iter().filter_map(|n| n.metadata.name).collect())
}

/// Make sure every node has a current distribution job.
pub async fn ensure_artifacts_job_for_nodes(cluster: &dyn Cluster, inst: &Installation, cfg: &ArtifactsJobConfig) -> Result<()> {
    let Some(hash) = artifacts_hash(inst)? else {
        debug!(installation = %inst.display_name(), "no artifact locations; nothing to distribute");
        return Ok(());
    };
    let owner = inst.display_name();
    cluster.ensure_namespace(&cfg.namespace).await.map_err(Error::Cluster)?;

    for node in node_names(cluster).await? {
        let name = job_name_for_node(&node);
        if let Some(existing) = cluster.get_job(&cfg.namespace, &name).await.map_err(Error::Cluster)? {
            if is_terminating(&existing) {
                debug!(node = %node, job = %name, "old artifacts job still terminating; creating on a later pass");
                continue;
            }
            if job_is_current(&existing, &owner, &hash) {
                debug!(node = %node, job = %name, "artifacts job up to date");
                continue;
            }
            info!(node = %node, job = %name, "artifacts job stale; recreating");
            cluster.delete_job(&cfg.namespace, &name).await.map_err(Error::Cluster)?;
            counter!("artifacts_jobs_recreated_total", 1u64);
            // Foreground deletion keeps the name taken until the pods are gone.
            if cluster.get_job(&cfg.namespace, &name).await.map_err(Error::Cluster)?.is_some() {
                info!(node = %node, job = %name, "old artifacts job terminating; creating on a later pass");
                continue;
            }
        }
        let job = build_job(inst, &node, &hash, cfg)?;
        cluster.create_job(&job).await.map_err(Error::Cluster)?;
        info!(node = %node, job = %name, hash = %hash, "artifacts job created");
    }
    Ok(())
}

/// Read-only view: each node's job when it is current, `None` when it is
/// missing or stale.
pub async fn list_artifacts_job_for_nodes(cluster: &dyn Cluster, inst: &Installation, cfg: &ArtifactsJobConfig) -> Result<BTreeMap<String, Option<Job>>> {
    let hash = artifacts_hash(inst)?;
    let owner = inst.display_name();
    let mut out = BTreeMap::new();
    for node in node_names(cluster).await? {
        let current = match &hash {
            None => None,
            Some(hash) => cluster
                .get_job(&cfg.namespace, &job_name_for_node(&node))
                .await
                .map_err(Error::Cluster)?
                .filter(|j| !is_terminating(j) && job_is_current(j, &owner, hash)),
        };
        out.insert(node, current);
    }
    Ok(out)
}

fn is_terminating(job: &Job) -> bool {
    job.metadata.deletion_timestamp.is_some()
}

/// Whether a job reported completion.
pub fn job_succeeded(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::{ArtifactsLocation, InstallationSpec};
    use outpost_kubehub::fake::{FakeCluster, Op};

    fn inst(images: &str) -> Installation {
        let mut i = Installation::new(
            "20241017120000",
            InstallationSpec {
                artifacts: Some(ArtifactsLocation {
                    images: images.into(),
                    helm_charts: "registry/charts:1".into(),
                    embedded_cluster_binary: "registry/bin:1".into(),
                    embedded_cluster_metadata: "registry/meta:1".into(),
                }),
                ..Default::default()
            },
        );
        i.metadata.uid = Some("0b6e0b57-7c36-4c5e-9a3b-5d1f0d7c8e11".into());
        i
    }

    fn cluster(nodes: &[&str]) -> FakeCluster {
        let c = FakeCluster::new();
        for n in nodes { c.add_node(n); }
        c
    }

    fn cfg() -> ArtifactsJobConfig {
        ArtifactsJobConfig { namespace: "outpost-system".into(), image: "proxy/mirror:1.0".into(), data_dir: "/var/lib/outpost".into(), pull_secret: "registry-creds".into() }
    }

    #[test]
    fn build_job_wires_node_and_snapshot() {
        let i = inst("registry/images:1");
        let job = build_job(&i, "node-a", "abc", &cfg()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("copy-artifacts-node-a"));
        assert_eq!(job.metadata.owner_references.as_ref().unwrap()[0].kind, "Installation");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.node_selector.unwrap()[HOSTNAME_LABEL], "node-a");
        let env = &pod.containers[0].env.as_ref().unwrap()[0];
        let decoded = base64::engine::general_purpose::STANDARD.decode(env.value.as_ref().unwrap()).unwrap();
        let back: Installation = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back.spec.artifacts.unwrap().images, "registry/images:1");
        assert_eq!(pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path, "/var/lib/outpost");
    }

    #[test]
    fn no_owner_ref_without_identity() {
        let mut i = inst("x");
        i.metadata.uid = None;
        assert!(build_job(&i, "n", "h", &cfg()).unwrap().metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn creates_one_job_per_node_then_leaves_them() {
        let c = cluster(&["node-a", "node-b"]);
        let i = inst("registry/images:1");
        ensure_artifacts_job_for_nodes(&c, &i, &cfg()).await.unwrap();
        assert_eq!(c.jobs().len(), 2);
        c.clear_ops();
        ensure_artifacts_job_for_nodes(&c, &i, &cfg()).await.unwrap();
        assert!(c.ops().is_empty(), "{:?}", c.ops());
    }

    #[tokio::test]
    async fn hash_change_recreates_once_per_node() {
        let c = cluster(&["node-a", "node-b"]);
        ensure_artifacts_job_for_nodes(&c, &inst("registry/images:1"), &cfg()).await.unwrap();
        c.clear_ops();
        let next = inst("registry/images:2");
        ensure_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert_eq!(
            c.ops(),
            vec![
                Op::DeleteJob("copy-artifacts-node-a".into()),
                Op::CreateJob("copy-artifacts-node-a".into()),
                Op::DeleteJob("copy-artifacts-node-b".into()),
                Op::CreateJob("copy-artifacts-node-b".into()),
            ]
        );
        let hash = artifacts_hash(&next).unwrap().unwrap();
        assert!(c.jobs().iter().all(|j| job_is_current(j, "20241017120000", &hash)));
    }

    #[tokio::test]
    async fn terminating_job_defers_create_without_aborting_other_nodes() {
        let c = cluster(&["node-a", "node-b"]);
        ensure_artifacts_job_for_nodes(&c, &inst("registry/images:1"), &cfg()).await.unwrap();
        c.keep_terminating_jobs();
        c.clear_ops();

        let next = inst("registry/images:2");
        ensure_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert_eq!(c.ops(), vec![Op::DeleteJob("copy-artifacts-node-a".into()), Op::DeleteJob("copy-artifacts-node-b".into())]);

        // still terminating: nothing to do, and no second delete
        c.clear_ops();
        ensure_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert!(c.ops().is_empty(), "{:?}", c.ops());
        let listed = list_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert!(listed.values().all(Option::is_none));

        c.finish_deletions();
        ensure_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert_eq!(c.ops(), vec![Op::CreateJob("copy-artifacts-node-a".into()), Op::CreateJob("copy-artifacts-node-b".into())]);
        let hash = artifacts_hash(&next).unwrap().unwrap();
        assert!(c.jobs().iter().all(|j| job_is_current(j, "20241017120000", &hash)));
    }

    #[tokio::test]
    async fn new_installation_name_recreates() {
        let c = cluster(&["node-a"]);
        ensure_artifacts_job_for_nodes(&c, &inst("registry/images:1"), &cfg()).await.unwrap();
        c.clear_ops();
        let mut next = inst("registry/images:1");
        next.metadata.name = Some("20241018090000".into());
        ensure_artifacts_job_for_nodes(&c, &next, &cfg()).await.unwrap();
        assert_eq!(c.ops().len(), 2);
    }

    #[tokio::test]
    async fn listing_reports_stale_and_missing_as_none() {
        let c = cluster(&["node-a", "node-b"]);
        let old = inst("registry/images:1");
        ensure_artifacts_job_for_nodes(&c, &old, &cfg()).await.unwrap();
        c.delete_job("outpost-system", "copy-artifacts-node-b").await.unwrap();
        c.clear_ops();

        let listed = list_artifacts_job_for_nodes(&c, &old, &cfg()).await.unwrap();
        assert!(listed["node-a"].is_some());
        assert!(listed["node-b"].is_none());

        let listed = list_artifacts_job_for_nodes(&c, &inst("registry/images:2"), &cfg()).await.unwrap();
        assert!(listed.values().all(Option::is_none));
        assert!(c.ops().is_empty(), "listing must not mutate");
    }

    #[tokio::test]
    async fn no_artifacts_is_noop() {
        let c = cluster(&["node-a"]);
        let mut i = inst("x");
        i.spec.artifacts = None;
        ensure_artifacts_job_for_nodes(&c, &i, &cfg()).await.unwrap();
        assert!(c.ops().is_empty());
        let listed = list_artifacts_job_for_nodes(&c, &i, &cfg()).await.unwrap();
        assert!(listed["node-a"].is_none());
    }
}
