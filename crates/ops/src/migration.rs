//! One-shot migration of node-local registry data into the object store.
//!
//! Driven from the controller side: decides whether the migration job must
//! be created, is still running, failed, or is finished. Completion is
//! recorded by the job itself through a sentinel secret; that secret is the
//! only source of truth, the job is disposable once it exists.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecretKeySelector, ServiceAccount, Volume,
    VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use outpost_core::{Condition, ConditionStatus, Error, Installation, Result};
use outpost_kubehub::{Cluster, StatusSink};
use tracing::{debug, info, warn};

pub const MIGRATION_CONDITION: &str = "RegistryMigrationStatus";

pub const REASON_NOT_DEPLOYED: &str = "ObjectStoreNotDeployed";
pub const REASON_IN_PROGRESS: &str = "MigrationInProgress";
pub const REASON_FAILED: &str = "MigrationJobFailed";
pub const REASON_COMPLETE: &str = "MigrationComplete";

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub namespace: String,
    pub job_name: String,
    pub sentinel_secret: String,
    pub object_store_namespace: String,
    pub object_store_statefulset: String,
    /// Secret holding the object store's S3 credentials.
    pub s3_secret: String,
    pub registry_deployment: String,
    pub s3_endpoint: String,
    pub bucket: String,
    pub image: String,
    pub service_account: String,
    pub data_dir: String,
    pub node_selector: BTreeMap<String, String>,
}

impl MigrationConfig {
    pub fn new(image: impl Into<String>) -> Self {
        let data_dir = std::env::var("OUTPOST_DATA_DIR").unwrap_or_else(|_| "/var/lib/outpost".to_string());
        Self {
            namespace: "registry".into(),
            job_name: "registry-data-migration".into(),
            sentinel_secret: "registry-data-migration-complete".into(),
            object_store_namespace: "seaweedfs".into(),
            object_store_statefulset: "seaweedfs-filer".into(),
            s3_secret: "seaweedfs-s3-rw".into(),
            registry_deployment: "registry".into(),
            s3_endpoint: "http://seaweedfs-s3.seaweedfs:8333".into(),
            bucket: "registry".into(),
            image: image.into(),
            service_account: "registry-data-migration".into(),
            data_dir: format!("{}/registry", data_dir.trim_end_matches('/')),
            node_selector: BTreeMap::from([("node-role.kubernetes.io/control-plane".to_string(), String::new())]),
        }
    }
}

/// Where a migration stands after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Installation does not need a migration.
    NotRequired,
    /// Waiting on the object store to come up.
    WaitingForDependency,
    InProgress,
    Complete,
    /// Job exists in a state we do not act on; next pass looks again.
    Waiting,
}

fn statefulset_ready(sts: &StatefulSet) -> bool {
    let want = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    want > 0 && ready >= want
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Failed" && c.status == "True"))
        .unwrap_or(false)
}

fn job_active(job: &Job) -> bool {
    job.status.as_ref().and_then(|s| s.active).unwrap_or(0) > 0
}

async fn mark(sink: &dyn StatusSink, inst: &mut Installation, status: ConditionStatus, reason: &str, message: &str) -> Result<()> {
    let generation = inst.generation();
    inst.set_condition(Condition::new(MIGRATION_CONDITION, status, reason, message, generation));
    sink.flush(inst).await.map_err(Error::Status)
}

/// Advance the registry data migration by one step.
pub async fn migrate_registry_data(cluster: &dyn Cluster, sink: &dyn StatusSink, inst: &mut Installation, cfg: &MigrationConfig) -> Result<MigrationState> {
    if !inst.wants_registry_migration() {
        return Ok(MigrationState::NotRequired);
    }
    if inst.conditions().map(|c| c.is_true(MIGRATION_CONDITION)).unwrap_or(false) {
        return Ok(MigrationState::Complete);
    }

    if cluster.get_secret(&cfg.namespace, &cfg.sentinel_secret).await.map_err(Error::Cluster)?.is_some() {
        info!(installation = %inst.display_name(), "registry data migration complete");
        mark(sink, inst, ConditionStatus::True, REASON_COMPLETE, "").await?;
        if let Err(e) = cluster.delete_job(&cfg.namespace, &cfg.job_name).await {
            warn!(error = %e, job = %cfg.job_name, "could not remove finished migration job");
        }
        return Ok(MigrationState::Complete);
    }

    let ready = cluster
        .get_statefulset(&cfg.object_store_namespace, &cfg.object_store_statefulset)
        .await
        .map_err(Error::Cluster)?
        .map(|s| statefulset_ready(&s))
        .unwrap_or(false);
    if !ready {
        debug!(ns = %cfg.object_store_namespace, sts = %cfg.object_store_statefulset, "object store not ready");
        mark(sink, inst, ConditionStatus::False, REASON_NOT_DEPLOYED, "waiting for the object store to become ready").await?;
        return Ok(MigrationState::WaitingForDependency);
    }

    if let Some(job) = cluster.get_job(&cfg.namespace, &cfg.job_name).await.map_err(Error::Cluster)? {
        if job_failed(&job) {
            mark(sink, inst, ConditionStatus::False, REASON_FAILED, "registry data migration job failed").await?;
            return Err(Error::JobFailed(cfg.job_name.clone()));
        }
        if job_active(&job) {
            mark(sink, inst, ConditionStatus::False, REASON_IN_PROGRESS, "").await?;
            return Ok(MigrationState::InProgress);
        }
        // Neither running nor failed (e.g. pending pod, or succeeded without
        // the sentinel yet). Nothing to act on; a later pass looks again.
        warn!(job = %cfg.job_name, status = ?job.status, "migration job in unhandled state");
        return Ok(MigrationState::Waiting);
    }

    ensure_job_identity(cluster, inst, cfg).await?;
    let job = build_migration_job(inst, cfg);
    cluster.create_job(&job).await.map_err(Error::Cluster)?;
    info!(job = %cfg.job_name, ns = %cfg.namespace, "registry data migration job created");
    mark(sink, inst, ConditionStatus::False, REASON_IN_PROGRESS, "").await?;
    Ok(MigrationState::InProgress)
}

/// Service account the job runs as, with just enough access to stop the
/// registry and write the sentinel.
async fn ensure_job_identity(cluster: &dyn Cluster, inst: &Installation, cfg: &MigrationConfig) -> Result<()> {
    cluster.apply_service_account(&build_service_account(inst, cfg)).await.map_err(Error::Cluster)?;
    cluster.apply_role(&build_role(inst, cfg)).await.map_err(Error::Cluster)?;
    cluster.apply_role_binding(&build_role_binding(inst, cfg)).await.map_err(Error::Cluster)?;
    debug!(ns = %cfg.namespace, service_account = %cfg.service_account, "migration job identity applied");
    Ok(())
}

fn identity_meta(inst: &Installation, cfg: &MigrationConfig) -> ObjectMeta {
    ObjectMeta {
        name: Some(cfg.service_account.clone()),
        namespace: Some(cfg.namespace.clone()),
        labels: Some(BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), "outpost".to_string())])),
        owner_references: inst.owner_reference().map(|o| vec![o]),
        ..Default::default()
    }
}

pub fn build_service_account(inst: &Installation, cfg: &MigrationConfig) -> ServiceAccount {
    ServiceAccount { metadata: identity_meta(inst, cfg), ..Default::default() }
}

fn rule(group: &str, resources: &[&str], names: Option<&str>, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        resource_names: names.map(|n| vec![n.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub fn build_role(inst: &Installation, cfg: &MigrationConfig) -> Role {
    Role {
        metadata: identity_meta(inst, cfg),
        rules: Some(vec![
            rule("apps", &["deployments", "deployments/scale"], Some(cfg.registry_deployment.as_str()), &["get", "patch", "update"]),
            // create cannot be limited by name
            rule("", &["secrets"], None, &["create"]),
            rule("", &["secrets"], Some(cfg.sentinel_secret.as_str()), &["get", "update"]),
        ]),
    }
}

pub fn build_role_binding(inst: &Installation, cfg: &MigrationConfig) -> RoleBinding {
    RoleBinding {
        metadata: identity_meta(inst, cfg),
        role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "Role".into(), name: cfg.service_account.clone() },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: cfg.service_account.clone(),
            namespace: Some(cfg.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector { name: Some(secret.into()), key: key.into(), optional: Some(false) }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() }
}

pub fn build_migration_job(inst: &Installation, cfg: &MigrationConfig) -> Job {
    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "registry-data-migration".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "outpost".to_string()),
    ]);
    let env = vec![
        secret_env("S3_ACCESS_KEY_ID", &cfg.s3_secret, "s3AccessKey"),
        secret_env("S3_SECRET_ACCESS_KEY", &cfg.s3_secret, "s3SecretKey"),
        plain_env("S3_ENDPOINT", &cfg.s3_endpoint),
        plain_env("S3_BUCKET", &cfg.bucket),
        plain_env("REGISTRY_NAMESPACE", &cfg.namespace),
        plain_env("REGISTRY_DEPLOYMENT", &cfg.registry_deployment),
        plain_env("REGISTRY_DATA_DIR", &cfg.data_dir),
        plain_env("MIGRATION_SENTINEL_SECRET", &cfg.sentinel_secret),
    ];
    let container = Container {
        name: "migrate-registry-data".into(),
        image: Some(cfg.image.clone()),
        command: Some(vec!["outpostctl".into(), "migrate-registry-data".into()]),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount { name: "registry-data".into(), mount_path: cfg.data_dir.clone(), ..Default::default() }]),
        ..Default::default()
    };
    Job {
        metadata: ObjectMeta {
            name: Some(cfg.job_name.clone()),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: inst.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    service_account_name: Some(cfg.service_account.clone()),
                    restart_policy: Some("Never".into()),
                    node_selector: Some(cfg.node_selector.clone()),
                    volumes: Some(vec![Volume {
                        name: "registry-data".into(),
                        host_path: Some(HostPathVolumeSource { path: cfg.data_dir.clone(), type_: Some("Directory".into()) }),
                        ..Default::default()
                    }]),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
