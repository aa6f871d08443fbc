//! Outpost kubehub: control-plane access for the reconcilers.
//!
//! Everything the reconcilers need from the cluster goes through the
//! [`Cluster`] trait so passes can run against the in-memory fake in tests.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{config::KubeConfigOptions, Client, Config};
use tracing::debug;

pub mod cluster;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod status;

pub use cluster::{create_or_update, is_already_exists, is_not_found, Cluster, KubeCluster};
pub use status::{KubeStatusSink, MemorySink, StatusSink};

/// Build a client from `OUTPOST_KUBECONFIG` when set, else the ambient config.
pub async fn get_kube_client() -> Result<Client> {
    match std::env::var("OUTPOST_KUBECONFIG") {
        Ok(path) if !path.is_empty() => {
            debug!(kubeconfig = %path, "loading kubeconfig");
            let kc = kube::config::Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("building kube config")?;
            Ok(Client::try_from(cfg)?)
        }
        _ => Ok(Client::try_default().await?),
    }
}
