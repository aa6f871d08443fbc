//! The installation record: parent of every condition the reconcilers write.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionSet};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "outpost.io", version = "v1beta1", kind = "Installation", status = "InstallationStatus")]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// Cluster has no route to the public registry.
    #[serde(default)]
    pub airgap: bool,
    #[serde(default)]
    pub high_availability: bool,
    /// Where the per-node artifacts are fetched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsLocation>,
    #[serde(default)]
    pub config_version: String,
}

/// Artifact locations (OCI references) distributed to every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsLocation {
    pub images: String,
    pub helm_charts: String,
    pub embedded_cluster_binary: String,
    pub embedded_cluster_metadata: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    #[schemars(with = "Vec<Condition>")]
    pub conditions: ConditionSet,
}

impl Installation {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn conditions(&self) -> Option<&ConditionSet> {
        self.status.as_ref().map(|s| &s.conditions)
    }

    pub fn conditions_mut(&mut self) -> &mut ConditionSet {
        &mut self.status.get_or_insert_with(InstallationStatus::default).conditions
    }

    /// Upsert a condition by type. `observed_generation` is taken as given;
    /// callers stamp it from [`Installation::generation`].
    pub fn set_condition(&mut self, cond: Condition) {
        self.conditions_mut().set(cond);
    }

    pub fn has_identity(&self) -> bool {
        self.metadata.uid.as_deref().map(|u| !u.is_empty()).unwrap_or(false)
    }

    /// Controller owner reference, only available once persisted.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        if !self.has_identity() {
            return None;
        }
        self.controller_owner_ref(&())
    }

    pub fn display_name(&self) -> String {
        self.name_any()
    }

    /// Whether the registry data must move into the object store.
    pub fn wants_registry_migration(&self) -> bool {
        self.spec.airgap && self.spec.high_availability
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionStatus;

    #[test]
    fn owner_ref_requires_uid() {
        let mut inst = Installation::new("20241001", InstallationSpec::default());
        assert!(inst.owner_reference().is_none());
        inst.metadata.uid = Some("3b1f3f0c-6b3f-4a53-8a3e-1f2b3c4d5e6f".into());
        let oref = inst.owner_reference().unwrap();
        assert_eq!(oref.kind, "Installation");
        assert_eq!(oref.api_version, "outpost.io/v1beta1");
        assert_eq!(oref.controller, Some(true));
    }

    #[test]
    fn set_condition_initialises_status() {
        let mut inst = Installation::new("i", InstallationSpec::default());
        assert!(inst.conditions().is_none());
        inst.set_condition(Condition::new("a-x", ConditionStatus::True, "Installed", "", 0));
        assert!(inst.conditions().unwrap().is_true("a-x"));
    }

    #[test]
    fn migration_only_for_airgap_ha() {
        let mut spec = InstallationSpec { airgap: true, ..Default::default() };
        assert!(!Installation::new("i", spec.clone()).wants_registry_migration());
        spec.high_availability = true;
        assert!(Installation::new("i", spec).wants_registry_migration());
    }

    #[test]
    fn set_condition_keeps_callers_generation() {
        let mut inst = Installation::new("i", InstallationSpec::default());
        inst.metadata.generation = Some(4);
        inst.set_condition(Condition::new("a-x", ConditionStatus::True, "Installed", "", 3));
        assert_eq!(inst.conditions().unwrap().get("a-x").unwrap().observed_generation, 3);
        assert!(!inst.conditions().unwrap().is_true_for("a-x", inst.generation()));
    }
}
