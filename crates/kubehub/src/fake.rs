//! In-memory control plane for reconciler tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec, DeploymentStatus, StatefulSet, StatefulSetSpec, StatefulSetStatus},
    batch::v1::{Job, JobStatus},
    core::v1::{Node, Secret, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;

use crate::cluster::Cluster;

/// Mutating calls recorded by [`FakeCluster`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    CreateJob(String),
    DeleteJob(String),
    ApplySecret(String),
    Scale { name: String, replicas: i32 },
    EnsureNamespace(String),
    ApplyServiceAccount(String),
    ApplyRole(String),
    ApplyRoleBinding(String),
}

/// Calls that can be made to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    CreateJob,
    ApplySecret,
    ApplyRole,
    Scale(i32),
}

type Key = (String, String);

#[derive(Default)]
struct State {
    jobs: BTreeMap<Key, Job>,
    secrets: BTreeMap<Key, Secret>,
    statefulsets: BTreeMap<Key, StatefulSet>,
    deployments: BTreeMap<Key, Deployment>,
    service_accounts: BTreeMap<Key, ServiceAccount>,
    roles: BTreeMap<Key, Role>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    nodes: Vec<Node>,
    namespaces: BTreeSet<String>,
    ops: Vec<Op>,
    failures: Vec<Failure>,
    // jobs linger with a deletionTimestamp until `finish_deletions`
    foreground_deletes: bool,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(ns: &str, name: &str) -> Key { (ns.to_string(), name.to_string()) }

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut st)
    }

    pub fn add_node(&self, name: &str) {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        self.with(|st| st.nodes.push(node));
    }

    pub fn add_statefulset(&self, ns: &str, name: &str, replicas: i32, ready: i32) {
        let mut sts = StatefulSet::default();
        sts.metadata.name = Some(name.to_string());
        sts.metadata.namespace = Some(ns.to_string());
        sts.spec = Some(StatefulSetSpec { replicas: Some(replicas), ..Default::default() });
        sts.status = Some(StatefulSetStatus { replicas, ready_replicas: Some(ready), ..Default::default() });
        self.with(|st| st.statefulsets.insert(key(ns, name), sts));
    }

    pub fn add_deployment(&self, ns: &str, name: &str, replicas: i32) {
        let mut dep = Deployment::default();
        dep.metadata.name = Some(name.to_string());
        dep.metadata.namespace = Some(ns.to_string());
        dep.spec = Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() });
        dep.status = Some(DeploymentStatus { replicas: Some(replicas), ..Default::default() });
        self.with(|st| st.deployments.insert(key(ns, name), dep));
    }

    pub fn add_secret(&self, ns: &str, name: &str) {
        let mut s = Secret::default();
        s.metadata.name = Some(name.to_string());
        s.metadata.namespace = Some(ns.to_string());
        self.with(|st| st.secrets.insert(key(ns, name), s));
    }

    pub fn insert_job(&self, job: Job) {
        let k = key(job.metadata.namespace.as_deref().unwrap_or_default(), job.metadata.name.as_deref().unwrap_or_default());
        self.with(|st| st.jobs.insert(k, job));
    }

    pub fn set_job_status(&self, ns: &str, name: &str, status: JobStatus) {
        self.with(|st| {
            if let Some(j) = st.jobs.get_mut(&key(ns, name)) {
                j.status = Some(status);
            }
        });
    }

    /// Make deleted jobs stay behind, terminating, like foreground deletion
    /// on a real API server.
    pub fn keep_terminating_jobs(&self) {
        self.with(|st| st.foreground_deletes = true);
    }

    /// Let every terminating job go away.
    pub fn finish_deletions(&self) {
        self.with(|st| st.jobs.retain(|_, j| j.metadata.deletion_timestamp.is_none()));
    }

    pub fn fail(&self, failure: Failure) {
        self.with(|st| st.failures.push(failure));
    }

    pub fn ops(&self) -> Vec<Op> { self.with(|st| st.ops.clone()) }

    pub fn clear_ops(&self) { self.with(|st| st.ops.clear()) }

    pub fn job(&self, ns: &str, name: &str) -> Option<Job> { self.with(|st| st.jobs.get(&key(ns, name)).cloned()) }

    pub fn jobs(&self) -> Vec<Job> { self.with(|st| st.jobs.values().cloned().collect()) }

    pub fn secret(&self, ns: &str, name: &str) -> Option<Secret> { self.with(|st| st.secrets.get(&key(ns, name)).cloned()) }

    pub fn deployment_replicas(&self, ns: &str, name: &str) -> Option<i32> {
        self.with(|st| st.deployments.get(&key(ns, name)).and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas))
    }

    pub fn has_namespace(&self, name: &str) -> bool { self.with(|st| st.namespaces.contains(name)) }

    pub fn service_account(&self, ns: &str, name: &str) -> Option<ServiceAccount> {
        self.with(|st| st.service_accounts.get(&key(ns, name)).cloned())
    }

    pub fn role(&self, ns: &str, name: &str) -> Option<Role> { self.with(|st| st.roles.get(&key(ns, name)).cloned()) }

    pub fn role_binding(&self, ns: &str, name: &str) -> Option<RoleBinding> {
        self.with(|st| st.role_bindings.get(&key(ns, name)).cloned())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let ns = job.metadata.namespace.clone().ok_or_else(|| anyhow!("job missing namespace"))?;
        let name = job.metadata.name.clone().ok_or_else(|| anyhow!("job missing name"))?;
        self.with(|st| {
            if st.failures.contains(&Failure::CreateJob) {
                return Err(anyhow!("injected: create job {}", name));
            }
            if st.jobs.contains_key(&key(&ns, &name)) {
                return Err(anyhow!("job {}/{} already exists", ns, name));
            }
            st.jobs.insert(key(&ns, &name), job.clone());
            st.ops.push(Op::CreateJob(name));
            Ok(job.clone())
        })
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|st| {
            let k = key(namespace, name);
            if st.foreground_deletes {
                if let Some(job) = st.jobs.get_mut(&k) {
                    job.metadata.deletion_timestamp.get_or_insert_with(|| Time(Utc::now()));
                    st.ops.push(Op::DeleteJob(name.to_string()));
                }
            } else if st.jobs.remove(&k).is_some() {
                st.ops.push(Op::DeleteJob(name.to_string()));
            }
        });
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.with(|st| st.nodes.clone()))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let ns = secret.metadata.namespace.clone().unwrap_or_default();
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.with(|st| {
            if st.failures.contains(&Failure::ApplySecret) {
                return Err(anyhow!("injected: apply secret {}", name));
            }
            st.secrets.insert(key(&ns, &name), secret.clone());
            st.ops.push(Op::ApplySecret(name));
            Ok(())
        })
    }

    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.with(|st| st.statefulsets.get(&key(namespace, name)).cloned()))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.with(|st| st.deployments.get(&key(namespace, name)).cloned()))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.with(|st| {
            st.ops.push(Op::Scale { name: name.to_string(), replicas });
            if st.failures.contains(&Failure::Scale(replicas)) {
                return Err(anyhow!("injected: scale {} to {}", name, replicas));
            }
            let dep = st.deployments.get_mut(&key(namespace, name)).ok_or_else(|| anyhow!("deployment {}/{} not found", namespace, name))?;
            dep.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
            dep.status.get_or_insert_with(Default::default).replicas = Some(replicas);
            Ok(())
        })
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.with(|st| {
            if st.namespaces.insert(name.to_string()) {
                st.ops.push(Op::EnsureNamespace(name.to_string()));
            }
        });
        Ok(())
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<()> {
        let k = object_key(&sa.metadata)?;
        self.with(|st| {
            st.ops.push(Op::ApplyServiceAccount(k.1.clone()));
            st.service_accounts.insert(k, sa.clone());
        });
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        let k = object_key(&role.metadata)?;
        self.with(|st| {
            if st.failures.contains(&Failure::ApplyRole) {
                return Err(anyhow!("injected: apply role {}", k.1));
            }
            st.ops.push(Op::ApplyRole(k.1.clone()));
            st.roles.insert(k, role.clone());
            Ok(())
        })
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<()> {
        let k = object_key(&binding.metadata)?;
        self.with(|st| {
            st.ops.push(Op::ApplyRoleBinding(k.1.clone()));
            st.role_bindings.insert(k, binding.clone());
        });
        Ok(())
    }
}

fn object_key(meta: &ObjectMeta) -> Result<Key> {
    let ns = meta.namespace.clone().ok_or_else(|| anyhow!("object missing namespace"))?;
    let name = meta.name.clone().ok_or_else(|| anyhow!("object missing name"))?;
    Ok((ns, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scale_updates_spec_and_status() {
        let c = FakeCluster::new();
        c.add_deployment("registry", "registry", 2);
        c.scale_deployment("registry", "registry", 0).await.unwrap();
        let dep = c.get_deployment("registry", "registry").await.unwrap().unwrap();
        assert_eq!(dep.spec.unwrap().replicas, Some(0));
        assert_eq!(dep.status.unwrap().replicas, Some(0));
        assert_eq!(c.ops(), vec![Op::Scale { name: "registry".into(), replicas: 0 }]);
    }

    #[tokio::test]
    async fn injected_failure_still_records_attempt() {
        let c = FakeCluster::new();
        c.add_deployment("registry", "registry", 1);
        c.fail(Failure::Scale(0));
        assert!(c.scale_deployment("registry", "registry", 0).await.is_err());
        assert_eq!(c.deployment_replicas("registry", "registry"), Some(1));
        assert_eq!(c.ops().len(), 1);
    }

    #[tokio::test]
    async fn foreground_delete_leaves_job_terminating() {
        let c = FakeCluster::new();
        c.keep_terminating_jobs();
        let mut job = Job::default();
        job.metadata.name = Some("copy-artifacts-node-a".into());
        job.metadata.namespace = Some("outpost-system".into());
        c.create_job(&job).await.unwrap();
        c.delete_job("outpost-system", "copy-artifacts-node-a").await.unwrap();

        let lingering = c.get_job("outpost-system", "copy-artifacts-node-a").await.unwrap().unwrap();
        assert!(lingering.metadata.deletion_timestamp.is_some());
        assert!(c.create_job(&job).await.is_err(), "name still taken while terminating");

        c.finish_deletions();
        assert!(c.get_job("outpost-system", "copy-artifacts-node-a").await.unwrap().is_none());
        c.create_job(&job).await.unwrap();
    }
}
