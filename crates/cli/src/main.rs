use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::Api;
use outpost_apply::{diff, load_components, HelmCli, Reconciler};
use outpost_core::{Component, Installation};
use outpost_kubehub::{get_kube_client, KubeCluster, KubeStatusSink};
use outpost_ops::{artifacts, migrate_data, ArtifactsJobConfig, MigrateDataConfig, MigrationConfig, S3Store};
use serde_json::Value as Json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "outpostctl", version, about = "Outpost lifecycle reconcilers")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the actions a reconcile pass would take (no cluster access)
    Plan {
        #[arg(long)]
        previous: Option<PathBuf>,
        #[arg(long)]
        desired: PathBuf,
        /// YAML map of "namespace/name" to values overrides
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Reconcile chart components for an installation
    Reconcile {
        #[arg(long, env = "OUTPOST_INSTALLATION")]
        installation: String,
        #[arg(long)]
        previous: Option<PathBuf>,
        #[arg(long)]
        desired: PathBuf,
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Per-node artifact distribution jobs
    Artifacts {
        #[command(subcommand)]
        command: ArtifactsCommand,
    },
    /// Advance the registry data migration by one step
    MigrateRegistry {
        #[arg(long, env = "OUTPOST_INSTALLATION")]
        installation: String,
        /// Image the migration job runs
        #[arg(long, env = "OUTPOST_IMAGE")]
        image: String,
    },
    /// Copy registry data into the object store (runs inside the migration job)
    MigrateRegistryData,
}

#[derive(Subcommand, Debug)]
enum ArtifactsCommand {
    /// Create or recreate the job for every node
    Ensure {
        #[arg(long, env = "OUTPOST_INSTALLATION")]
        installation: String,
        /// Distribution tool image
        #[arg(long, env = "OUTPOST_ARTIFACTS_IMAGE")]
        image: String,
    },
    /// Show each node's current job, if any
    List {
        #[arg(long, env = "OUTPOST_INSTALLATION")]
        installation: String,
    },
}

fn init_tracing() {
    let env = std::env::var("OUTPOST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OUTPOST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OUTPOST_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_components(path: Option<&Path>) -> Result<Vec<Component>> {
    match path {
        None => Ok(Vec::new()),
        Some(p) => {
            let yaml = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            load_components(&yaml).with_context(|| format!("loading {}", p.display()))
        }
    }
}

/// Apply per-component value overrides keyed by "namespace/name".
fn with_overrides(components: Vec<Component>, path: Option<&Path>) -> Result<Vec<Component>> {
    let Some(p) = path else { return Ok(components) };
    let yaml = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
    let overrides: BTreeMap<String, Json> = serde_yaml::from_str(&yaml).with_context(|| format!("parsing overrides {}", p.display()))?;
    Ok(components
        .into_iter()
        .map(|c| match overrides.get(&c.key().to_string()) {
            Some(patch) => c.with_override(patch),
            None => c,
        })
        .collect())
}

async fn load_installation(client: kube::Client, name: &str) -> Result<Installation> {
    let api: Api<Installation> = Api::all(client);
    api.get(name).await.with_context(|| format!("getting installation {}", name))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_conditions(inst: &Installation, output: Output) -> Result<()> {
    let Some(conds) = inst.conditions() else { return Ok(()) };
    match output {
        Output::Json => print_json(conds),
        Output::Human => {
            println!("{:<40} {:<8} {:<24} MESSAGE", "TYPE", "STATUS", "REASON");
            for c in conds.iter() {
                println!("{:<40} {:<8} {:<24} {}", c.type_, c.status.to_string(), c.reason, c.message);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { previous, desired, overrides } => {
            let previous = with_overrides(read_components(previous.as_deref())?, overrides.as_deref())?;
            let desired = with_overrides(read_components(Some(&desired))?, overrides.as_deref())?;
            let plan = diff(&previous, &desired)?;
            match cli.output {
                Output::Json => print_json(&plan.ordered())?,
                Output::Human => {
                    for step in plan.ordered() {
                        println!("{:<10} {:<40} order={}", step.action.verb(), step.component.key().to_string(), step.component.order);
                    }
                }
            }
        }
        Commands::Reconcile { installation, previous, desired, overrides } => {
            let previous = with_overrides(read_components(previous.as_deref())?, overrides.as_deref())?;
            let desired = with_overrides(read_components(Some(&desired))?, overrides.as_deref())?;
            let client = get_kube_client().await?;
            let mut inst = load_installation(client.clone(), &installation).await?;
            let engine = HelmCli::default();
            let sink = KubeStatusSink::new(client);
            info!(installation = %installation, previous = previous.len(), desired = desired.len(), "reconcile invoked");
            let res = Reconciler::new(&engine, &sink).reconcile(&mut inst, &previous, &desired).await;
            print_conditions(&inst, cli.output)?;
            if let Err(e) = res {
                error!(error = %e, retryable = e.is_retryable(), "reconcile failed");
                return Err(e.into());
            }
        }
        Commands::Artifacts { command } => {
            let client = get_kube_client().await?;
            let cluster = KubeCluster::new(client.clone());
            match command {
                ArtifactsCommand::Ensure { installation, image } => {
                    let inst = load_installation(client, &installation).await?;
                    artifacts::ensure_artifacts_job_for_nodes(&cluster, &inst, &ArtifactsJobConfig::new(image)).await?;
                    info!(installation = %installation, "artifacts jobs ensured");
                }
                ArtifactsCommand::List { installation } => {
                    let inst = load_installation(client, &installation).await?;
                    let cfg = ArtifactsJobConfig::new(String::new());
                    let jobs = artifacts::list_artifacts_job_for_nodes(&cluster, &inst, &cfg).await?;
                    match cli.output {
                        Output::Json => {
                            let view: BTreeMap<&String, serde_json::Value> = jobs
                                .iter()
                                .map(|(n, j)| {
                                    let v = match j {
                                        Some(j) => serde_json::json!({"job": j.metadata.name, "succeeded": artifacts::job_succeeded(j)}),
                                        None => serde_json::Value::Null,
                                    };
                                    (n, v)
                                })
                                .collect();
                            print_json(&view)?;
                        }
                        Output::Human => {
                            println!("{:<40} {:<50} DONE", "NODE", "JOB");
                            for (node, job) in &jobs {
                                let (name, done) = match job {
                                    Some(j) => (j.metadata.name.clone().unwrap_or_default(), artifacts::job_succeeded(j)),
                                    None => ("-".to_string(), false),
                                };
                                println!("{:<40} {:<50} {}", node, name, done);
                            }
                        }
                    }
                }
            }
        }
        Commands::MigrateRegistry { installation, image } => {
            let client = get_kube_client().await?;
            let cluster = KubeCluster::new(client.clone());
            let sink = KubeStatusSink::new(client.clone());
            let mut inst = load_installation(client, &installation).await?;
            let state = outpost_ops::migrate_registry_data(&cluster, &sink, &mut inst, &MigrationConfig::new(image)).await;
            print_conditions(&inst, cli.output)?;
            match state {
                Ok(s) => info!(state = ?s, "registry migration pass done"),
                Err(e) => {
                    error!(error = %e, retryable = e.is_retryable(), "registry migration failed");
                    return Err(e.into());
                }
            }
        }
        Commands::MigrateRegistryData => {
            let cluster = KubeCluster::try_default().await?;
            let store = S3Store::from_env()?;
            let report = migrate_data::run(&cluster, &store, &MigrateDataConfig::from_env()).await?;
            match cli.output {
                Output::Json => print_json(&serde_json::json!({"files": report.files, "bytes": report.bytes}))?,
                Output::Human => println!("migrated {} files ({} bytes)", report.files, report.bytes),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overrides.yaml");
        std::fs::write(&path, "registry/docker-registry:\n  replicaCount: 2\n").unwrap();
        let comps = vec![
            Component::new("registry", "docker-registry", "oci://charts/docker-registry", "2.2.3").with_values(serde_json::json!({"replicaCount": 1, "tls": true})),
            Component::new("velero", "velero", "oci://charts/velero", "7.1.0"),
        ];
        let out = with_overrides(comps, Some(&path)).unwrap();
        assert_eq!(out[0].values, serde_json::json!({"replicaCount": 2, "tls": true}));
        assert!(out[1].values.is_null());
    }

    #[test]
    fn cli_parses_nested_artifacts() {
        let cli = Cli::try_parse_from(["outpostctl", "-o", "json", "artifacts", "ensure", "--installation", "i", "--image", "mirror:1"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Artifacts { command: ArtifactsCommand::Ensure { .. } }));
    }
}
