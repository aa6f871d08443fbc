//! Outpost apply: the component reconciler.
//!
//! Diffs the previous and desired component sets of an installation, then
//! installs, upgrades and uninstalls charts in dependency-safe order while
//! recording per-component progress as status conditions.

#![forbid(unsafe_code)]

pub mod diff;
pub mod engine;
pub mod reconcile;

pub use diff::{diff, Action, Plan, Step};
pub use engine::{ChartEngine, HelmCli};
pub use reconcile::{reconcile, Reconciler, CONFIG_CONDITION};

/// Load a component list from YAML (a sequence of components).
pub fn load_components(yaml: &str) -> anyhow::Result<Vec<outpost_core::Component>> {
    use anyhow::Context;
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(yaml).context("parsing component list")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_components_accepts_empty_and_list() {
        assert!(load_components("").unwrap().is_empty());
        let list = load_components("- name: openebs\n  namespace: openebs\n  chartRef: oci://charts/openebs\n  version: 4.1.0\n  order: 1\n  values:\n    engines:\n      local: true\n").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].values["engines"]["local"], true);
    }

    #[test]
    fn load_components_rejects_garbage() {
        let e = load_components("name: [").unwrap_err();
        assert!(format!("{:#}", e).contains("parsing component list"));
    }
}
