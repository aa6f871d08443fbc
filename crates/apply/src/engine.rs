//! Chart engine seam and the `helm` CLI implementation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use outpost_core::Component;
use tokio::process::Command;
use tracing::{debug, info};

/// Black-box chart install/upgrade/uninstall primitives.
#[async_trait]
pub trait ChartEngine: Send + Sync {
    async fn exists(&self, namespace: &str, release: &str) -> Result<bool>;
    async fn install(&self, component: &Component) -> Result<()>;
    /// Upgrade the release, installing it when it does not exist yet.
    async fn upgrade(&self, component: &Component, force: bool) -> Result<()>;
    async fn uninstall(&self, namespace: &str, release: &str, wait: bool) -> Result<()>;
}

/// Shells out to the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    bin: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl Default for HelmCli {
    fn default() -> Self {
        let bin = std::env::var("OUTPOST_HELM_BIN").unwrap_or_else(|_| "helm".to_string());
        let kubeconfig = std::env::var("OUTPOST_KUBECONFIG").ok().filter(|s| !s.is_empty()).map(PathBuf::from);
        Self { bin: PathBuf::from(bin), kubeconfig }
    }
}

fn timeout_arg(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

impl HelmCli {
    pub fn new(bin: impl Into<PathBuf>, kubeconfig: Option<PathBuf>) -> Self {
        Self { bin: bin.into(), kubeconfig }
    }

    fn global_args(&self, namespace: &str) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), namespace.to_string()];
        if let Some(kc) = &self.kubeconfig {
            args.push("--kubeconfig".into());
            args.push(kc.to_string_lossy().to_string());
        }
        args
    }

    fn install_args(&self, c: &Component, values: &Path) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            c.name.clone(),
            c.chart_ref.clone(),
            "--version".into(),
            c.version.clone(),
            "--create-namespace".into(),
            "--wait".into(),
            "--timeout".into(),
            timeout_arg(c.timeout_duration()),
            "--values".into(),
            values.to_string_lossy().to_string(),
        ];
        args.extend(self.global_args(&c.namespace));
        args
    }

    fn upgrade_args(&self, c: &Component, values: &Path, force: bool) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".into(),
            c.name.clone(),
            c.chart_ref.clone(),
            "--version".into(),
            c.version.clone(),
            "--create-namespace".into(),
            "--wait".into(),
            "--timeout".into(),
            timeout_arg(c.timeout_duration()),
            "--values".into(),
            values.to_string_lossy().to_string(),
        ];
        if force {
            args.push("--force".into());
        }
        args.extend(self.global_args(&c.namespace));
        args
    }

    fn uninstall_args(&self, namespace: &str, release: &str, wait: bool) -> Vec<String> {
        let mut args = vec!["uninstall".to_string(), release.to_string()];
        if wait {
            args.push("--wait".into());
        }
        args.extend(self.global_args(namespace));
        args
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        debug!(bin = %self.bin.display(), args = ?args, "helm");
        Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running {}", self.bin.display()))
    }

    async fn run_ok(&self, args: &[String]) -> Result<()> {
        let out = self.run(args).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("helm {}: {}", args.first().map(String::as_str).unwrap_or_default(), stderr.trim()));
        }
        Ok(())
    }
}

/// Values rendered to a temp YAML file that lives for the helm call.
fn values_file(c: &Component) -> Result<tempfile::NamedTempFile> {
    let mut f = tempfile::Builder::new().prefix("outpost-values-").suffix(".yaml").tempfile().context("creating values file")?;
    let yaml = if c.values.is_null() { String::from("{}\n") } else { serde_yaml::to_string(&c.values).context("rendering values")? };
    f.write_all(yaml.as_bytes()).context("writing values file")?;
    f.flush()?;
    Ok(f)
}

#[async_trait]
impl ChartEngine for HelmCli {
    async fn exists(&self, namespace: &str, release: &str) -> Result<bool> {
        let mut args = vec!["status".to_string(), release.to_string()];
        args.extend(self.global_args(namespace));
        let out = self.run(&args).await?;
        if out.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("not found") {
            return Ok(false);
        }
        Err(anyhow!("helm status {}/{}: {}", namespace, release, stderr.trim()))
    }

    async fn install(&self, c: &Component) -> Result<()> {
        let values = values_file(c)?;
        self.run_ok(&self.install_args(c, values.path())).await?;
        info!(release = %c.key(), version = %c.version, "chart installed");
        Ok(())
    }

    async fn upgrade(&self, c: &Component, force: bool) -> Result<()> {
        let values = values_file(c)?;
        self.run_ok(&self.upgrade_args(c, values.path(), force)).await?;
        info!(release = %c.key(), version = %c.version, force, "chart upgraded");
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str, wait: bool) -> Result<()> {
        self.run_ok(&self.uninstall_args(namespace, release, wait)).await?;
        info!(ns = %namespace, release, "chart uninstalled");
        Ok(())
    }
}
