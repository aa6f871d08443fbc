//! The migration procedure that runs inside the migration job.
//!
//! Stops the registry, copies its data directory into the object store and
//! drops the sentinel secret. If anything fails before the sentinel is
//! written, the registry is scaled back up so it never stays offline because
//! of a failed migration.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use outpost_kubehub::Cluster;
use tracing::{debug, error, info, warn};

/// Destination of the registry data.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket; an existing bucket is fine.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MigrateDataConfig {
    pub registry_namespace: String,
    pub registry_deployment: String,
    pub data_dir: PathBuf,
    pub bucket: String,
    pub sentinel_secret: String,
    /// How long to wait for the registry pods to go away.
    pub scale_down_timeout: Duration,
    pub poll_interval: Duration,
}

impl MigrateDataConfig {
    pub fn from_env() -> Self {
        let env = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.to_string());
        let wait = std::env::var("OUTPOST_MIGRATION_WAIT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(300);
        Self {
            registry_namespace: env("REGISTRY_NAMESPACE", "registry"),
            registry_deployment: env("REGISTRY_DEPLOYMENT", "registry"),
            data_dir: PathBuf::from(env("REGISTRY_DATA_DIR", "/var/lib/outpost/registry")),
            bucket: env("S3_BUCKET", "registry"),
            sentinel_secret: env("MIGRATION_SENTINEL_SECRET", "registry-data-migration-complete"),
            scale_down_timeout: Duration::from_secs(wait),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Outcome counters of a successful migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub files: u64,
    pub bytes: u64,
}

/// Run the migration. The registry is scaled back to one replica unless the
/// sentinel secret was written.
pub async fn run(cluster: &dyn Cluster, store: &dyn ObjectStore, cfg: &MigrateDataConfig) -> Result<MigrationReport> {
    let mut committed = false;
    let outcome = migrate(cluster, store, cfg, &mut committed).await;
    if !committed {
        warn!(ns = %cfg.registry_namespace, deployment = %cfg.registry_deployment, "migration did not complete; scaling registry back up");
        counter!("registry_migration_rollbacks_total", 1u64);
        if let Err(e) = cluster.scale_deployment(&cfg.registry_namespace, &cfg.registry_deployment, 1).await {
            error!(error = %format!("{:#}", e), "could not scale registry back up");
        }
    }
    outcome
}

async fn migrate(cluster: &dyn Cluster, store: &dyn ObjectStore, cfg: &MigrateDataConfig, committed: &mut bool) -> Result<MigrationReport> {
    info!(ns = %cfg.registry_namespace, deployment = %cfg.registry_deployment, "scaling registry down");
    cluster.scale_deployment(&cfg.registry_namespace, &cfg.registry_deployment, 0).await.context("scaling registry down")?;
    wait_for_scale_down(cluster, cfg).await?;

    store.ensure_bucket(&cfg.bucket).await.with_context(|| format!("ensuring bucket {}", cfg.bucket))?;
    let report = upload_dir(store, &cfg.bucket, &cfg.data_dir).await?;

    let sentinel = Secret {
        metadata: ObjectMeta {
            name: Some(cfg.sentinel_secret.clone()),
            namespace: Some(cfg.registry_namespace.clone()),
            labels: Some([("app.kubernetes.io/managed-by".to_string(), "outpost".to_string())].into()),
            ..Default::default()
        },
        type_: Some("Opaque".into()),
        ..Default::default()
    };
    cluster.apply_secret(&sentinel).await.context("writing migration sentinel")?;
    *committed = true;
    counter!("registry_migration_files_total", report.files);
    info!(files = report.files, bytes = report.bytes, "registry data migrated");
    Ok(report)
}

async fn wait_for_scale_down(cluster: &dyn Cluster, cfg: &MigrateDataConfig) -> Result<()> {
    let deadline = Instant::now() + cfg.scale_down_timeout;
    loop {
        let dep = cluster.get_deployment(&cfg.registry_namespace, &cfg.registry_deployment).await?;
        let running = dep.and_then(|d| d.status).and_then(|s| s.replicas).unwrap_or(0);
        if running == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("registry still has {} replicas after {}s", running, cfg.scale_down_timeout.as_secs()));
        }
        debug!(running, "waiting for registry pods to stop");
        tokio::time::sleep(cfg.poll_interval).await;
    }
}

/// Object key for `path` under `root`, always `/`-separated.
pub fn object_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str().ok_or_else(|| anyhow!("non-utf8 path {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

async fn upload_dir(store: &dyn ObjectStore, bucket: &str, root: &Path) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let key = object_key(root, entry.path())?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        store.put_file(bucket, &key, entry.path()).await.with_context(|| format!("uploading {}", key))?;
        debug!(key = %key, size, "uploaded");
        report.files += 1;
        report.bytes += size;
    }
    Ok(report)
}
