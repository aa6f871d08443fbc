//! Flushing installation status after each condition transition.

use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use outpost_core::{Installation, InstallationStatus};
use tracing::debug;

/// Persists the installation's status. Reconcilers call `flush` after every
/// condition write so a crash mid-pass loses at most the in-flight unit.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn flush(&self, installation: &Installation) -> Result<()>;
}

/// Merge-patches the `status` subresource of the Installation.
pub struct KubeStatusSink {
    api: Api<Installation>,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn flush(&self, installation: &Installation) -> Result<()> {
        let name = installation.name_any();
        let patch = serde_json::json!({ "status": installation.status });
        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching status of installation {}", name))?;
        debug!(installation = %name, "status flushed");
        Ok(())
    }
}

/// Records every flushed status; used by tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    flushed: Mutex<Vec<InstallationStatus>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn flushes(&self) -> Vec<InstallationStatus> {
        self.flushed.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<InstallationStatus> {
        self.flushes().pop()
    }
}

#[async_trait]
impl StatusSink for MemorySink {
    async fn flush(&self, installation: &Installation) -> Result<()> {
        let status = installation.status.clone().unwrap_or_default();
        if let Ok(mut v) = self.flushed.lock() {
            v.push(status);
        }
        Ok(())
    }
}
