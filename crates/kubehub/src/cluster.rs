//! Typed cluster operations behind a trait seam.

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::{Namespace, Node, Secret, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

/// Cluster operations used by the reconcilers.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;
    async fn create_job(&self, job: &Job) -> Result<Job>;
    /// Delete with foreground propagation so pods go before the job does.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Create or update in place.
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
    async fn ensure_namespace(&self, name: &str) -> Result<()>;
    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()>;
    /// Rules are replaced wholesale.
    async fn apply_role(&self, role: &Role) -> Result<()>;
    /// `roleRef` is immutable; only subjects and labels are updated in place.
    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()>;
}

fn namespaced_name<'a>(meta: &'a ObjectMeta, what: &str) -> Result<(&'a str, &'a str)> {
    let ns = meta.namespace.as_deref().ok_or_else(|| anyhow!("{} missing namespace", what))?;
    let name = meta.name.as_deref().ok_or_else(|| anyhow!("{} missing name", what))?;
    Ok((ns, name))
}

/// kube-rs backed implementation.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(crate::get_kube_client().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }
}

pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Get `name`, run `mutate` on it and write it back; create from `base` when
/// missing. A resource-version conflict on replace is retried once against a
/// fresh read.
pub async fn create_or_update<K, F>(api: &Api<K>, name: &str, base: K, mutate: F) -> Result<K>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    F: Fn(&mut K),
{
    for attempt in 0..2 {
        match api.get_opt(name).await? {
            Some(mut live) => {
                mutate(&mut live);
                match api.replace(name, &PostParams::default(), &live).await {
                    Ok(o) => return Ok(o),
                    Err(e) if is_conflict(&e) && attempt == 0 => {
                        debug!(name, "conflict on replace; re-reading");
                        continue;
                    }
                    Err(e) => return Err(anyhow!(e).context(format!("updating {}", name))),
                }
            }
            None => {
                let mut obj = base.clone();
                mutate(&mut obj);
                match api.create(&PostParams::default(), &obj).await {
                    Ok(o) => return Ok(o),
                    Err(e) if is_already_exists(&e) && attempt == 0 => continue,
                    Err(e) => return Err(anyhow!(e).context(format!("creating {}", name))),
                }
            }
        }
    }
    Err(anyhow!("create_or_update {}: gave up after conflict", name))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("getting job {}/{}", namespace, name))
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let ns = job.metadata.namespace.as_deref().ok_or_else(|| anyhow!("job missing namespace"))?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        let created = api.create(&PostParams::default(), job).await.context("creating job")?;
        counter!("kube_jobs_created_total", 1u64);
        info!(ns = %ns, job = ?created.metadata.name, "job created");
        Ok(created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {
                counter!("kube_jobs_deleted_total", 1u64);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!("deleting job {}/{}", namespace, name))),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await.context("listing nodes")?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("getting secret {}/{}", namespace, name))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let (ns, name) = namespaced_name(&secret.metadata, "secret")?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let desired = secret.clone();
        create_or_update(&api, name, secret.clone(), |live: &mut Secret| {
            live.metadata.labels = desired.metadata.labels.clone();
            live.data = desired.data.clone();
            live.string_data = desired.string_data.clone();
            live.type_ = desired.type_.clone();
        })
        .await?;
        Ok(())
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("getting statefulset {}/{}", namespace, name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("getting deployment {}/{}", namespace, name))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let pp = PatchParams::default();
        let payload = serde_json::json!({"spec": {"replicas": replicas}});
        match api.patch_scale(name, &pp, &Patch::Merge(&payload)).await {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "patch_scale failed; falling back to spec.replicas");
                api.patch(name, &pp, &Patch::Merge(&payload)).await.with_context(|| format!("scaling {}/{}", namespace, name))?;
            }
        }
        info!(ns = %namespace, deployment = %name, replicas, "deployment scaled");
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut base = Namespace::default();
        base.metadata.name = Some(name.to_string());
        create_or_update(&api, name, base, |ns: &mut Namespace| {
            ns.metadata.labels.get_or_insert_with(Default::default).insert("app.kubernetes.io/managed-by".into(), "outpost".into());
        })
        .await?;
        Ok(())
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()> {
        let (ns, name) = namespaced_name(&sa.metadata, "service account")?;
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), ns);
        let labels = sa.metadata.labels.clone();
        create_or_update(&api, name, sa.clone(), |live: &mut ServiceAccount| live.metadata.labels = labels.clone()).await?;
        debug!(ns = %ns, service_account = %name, "service account applied");
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        let (ns, name) = namespaced_name(&role.metadata, "role")?;
        let api: Api<Role> = Api::namespaced(self.client.clone(), ns);
        let desired = role.clone();
        create_or_update(&api, name, role.clone(), |live: &mut Role| {
            live.metadata.labels = desired.metadata.labels.clone();
            live.rules = desired.rules.clone();
        })
        .await?;
        debug!(ns = %ns, role = %name, "role applied");
        Ok(())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let (ns, name) = namespaced_name(&binding.metadata, "role binding")?;
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), ns);
        let desired = binding.clone();
        create_or_update(&api, name, binding.clone(), |live: &mut RoleBinding| {
            live.metadata.labels = desired.metadata.labels.clone();
            live.subjects = desired.subjects.clone();
        })
        .await?;
        debug!(ns = %ns, role_binding = %name, "role binding applied");
        Ok(())
    }
}
