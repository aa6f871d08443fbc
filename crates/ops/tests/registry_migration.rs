#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use outpost_core::{ConditionStatus, Error, Installation, InstallationSpec};
use outpost_kubehub::fake::{FakeCluster, Op};
use outpost_kubehub::MemorySink;
use outpost_ops::{migrate_data, migrate_registry_data, MigrateDataConfig, MigrationConfig, MigrationState, ObjectStore, MIGRATION_CONDITION};

#[derive(Default)]
struct Bucket {
    objects: Mutex<BTreeMap<String, usize>>,
    broken: bool,
}

#[async_trait]
impl ObjectStore for Bucket {
    async fn ensure_bucket(&self, _bucket: &str) -> Result<()> { Ok(()) }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        if self.broken {
            return Err(anyhow!("503 slow down"));
        }
        let len = std::fs::metadata(path)?.len() as usize;
        self.objects.lock().unwrap().insert(format!("{}/{}", bucket, key), len);
        Ok(())
    }
}

fn cluster() -> FakeCluster {
    let c = FakeCluster::new();
    c.add_statefulset("seaweedfs", "seaweedfs-filer", 1, 1);
    c.add_deployment("registry", "registry", 1);
    c
}

fn installation() -> Installation {
    let mut i = Installation::new("20241017120000", InstallationSpec { airgap: true, high_availability: true, ..Default::default() });
    i.metadata.uid = Some("3f0d2a4e-9d8b-4c55-8f3a-6a1d1b6f2e90".into());
    i.metadata.generation = Some(2);
    i
}

fn data_cfg(dir: &Path) -> MigrateDataConfig {
    MigrateDataConfig {
        registry_namespace: "registry".into(),
        registry_deployment: "registry".into(),
        data_dir: dir.to_path_buf(),
        bucket: "registry".into(),
        sentinel_secret: "registry-data-migration-complete".into(),
        scale_down_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    }
}

fn registry_data() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("docker/registry/v2/repositories/outpost/_manifests");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("link"), b"sha256:0123").unwrap();
    dir
}

#[tokio::test]
async fn full_migration_reaches_complete() {
    let c = cluster();
    let sink = MemorySink::new();
    let mut inst = installation();
    let cfg = MigrationConfig::new("proxy/outpost:1.0");

    assert_eq!(migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap(), MigrationState::InProgress);
    c.set_job_status("registry", "registry-data-migration", JobStatus { active: Some(1), ..Default::default() });
    assert_eq!(migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap(), MigrationState::InProgress);

    // what the job's pod does
    let data = registry_data();
    let store = Bucket::default();
    let report = migrate_data::run(&c, &store, &data_cfg(data.path())).await.unwrap();
    assert_eq!(report.files, 1);
    assert_eq!(c.deployment_replicas("registry", "registry"), Some(0));

    assert_eq!(migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap(), MigrationState::Complete);
    let cond = inst.conditions().unwrap().get(MIGRATION_CONDITION).unwrap();
    assert_eq!(cond.status, ConditionStatus::True);
    assert_eq!(cond.observed_generation, 2);
    assert!(c.job("registry", "registry-data-migration").is_none());

    let ops = c.ops();
    assert_eq!(ops.iter().filter(|op| matches!(op, Op::CreateJob(_))).count(), 1);
    assert!(!ops.contains(&Op::Scale { name: "registry".into(), replicas: 1 }));
}

#[tokio::test]
async fn failed_upload_restores_registry_and_surfaces_failure() {
    let c = cluster();
    let sink = MemorySink::new();
    let mut inst = installation();
    let cfg = MigrationConfig::new("proxy/outpost:1.0");
    migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap();

    let data = registry_data();
    let store = Bucket { broken: true, ..Default::default() };
    assert!(migrate_data::run(&c, &store, &data_cfg(data.path())).await.is_err());
    assert_eq!(c.deployment_replicas("registry", "registry"), Some(1));
    assert!(c.secret("registry", "registry-data-migration-complete").is_none());

    c.set_job_status(
        "registry",
        "registry-data-migration",
        JobStatus {
            failed: Some(1),
            conditions: Some(vec![JobCondition { type_: "Failed".into(), status: "True".into(), ..Default::default() }]),
            ..Default::default()
        },
    );
    let err = migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap_err();
    assert!(matches!(err, Error::JobFailed(_)));
    assert!(!err.is_retryable());
    let last = sink.last().unwrap();
    let cond = last.conditions.get(MIGRATION_CONDITION).unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, "MigrationJobFailed");
}

#[tokio::test]
async fn waits_for_object_store_before_creating_job() {
    let c = FakeCluster::new();
    c.add_statefulset("seaweedfs", "seaweedfs-filer", 3, 1);
    let sink = MemorySink::new();
    let mut inst = installation();
    let cfg = MigrationConfig::new("proxy/outpost:1.0");
    assert_eq!(migrate_registry_data(&c, &sink, &mut inst, &cfg).await.unwrap(), MigrationState::WaitingForDependency);
    assert!(c.jobs().is_empty());
    assert_eq!(inst.conditions().unwrap().get(MIGRATION_CONDITION).unwrap().reason, "ObjectStoreNotDeployed");
}
