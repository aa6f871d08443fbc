//! Previous-vs-desired diffing of component sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use outpost_core::{Component, ComponentKey, Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Install,
    Upgrade,
    Uninstall,
    NoChange,
}

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Uninstall => "uninstall",
            Action::NoChange => "noop",
        }
    }

    /// Reason written before the attempt; no-ops skip it.
    pub fn progressing_reason(&self) -> Option<&'static str> {
        match self {
            Action::Install => Some("Installing"),
            Action::Upgrade => Some("Upgrading"),
            Action::Uninstall => Some("Uninstalling"),
            Action::NoChange => None,
        }
    }

    pub fn done_reason(&self) -> &'static str {
        match self {
            Action::Install => "Installed",
            Action::Upgrade => "Upgraded",
            Action::Uninstall => "Uninstalled",
            Action::NoChange => "Unchanged",
        }
    }

    pub fn failed_reason(&self) -> &'static str {
        match self {
            Action::Install => "InstallFailed",
            Action::Upgrade => "UpgradeFailed",
            Action::Uninstall => "UninstallFailed",
            Action::NoChange => "UnchangedFailed",
        }
    }

    // Tie-break among equal `order`: new releases first, untouched ones last.
    fn rank(&self) -> u8 {
        match self {
            Action::Install => 0,
            Action::Upgrade => 1,
            Action::NoChange => 2,
            Action::Uninstall => 3,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action: Action,
    pub component: Component,
}

impl Step {
    fn new(action: Action, component: &Component) -> Self {
        Self { action, component: component.clone() }
    }
}

/// Result of diffing two component sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Previous-only components, ascending `order`.
    pub uninstalls: Vec<Step>,
    /// Install/upgrade/no-change, ascending `order`.
    pub applies: Vec<Step>,
}

impl Plan {
    /// Execution order: uninstalls highest `order` first, then everything
    /// else lowest `order` first.
    pub fn ordered(&self) -> Vec<&Step> {
        let mut out: Vec<&Step> = self.uninstalls.iter().rev().collect();
        out.extend(self.applies.iter());
        out
    }

    pub fn is_noop(&self) -> bool {
        self.uninstalls.is_empty() && self.applies.iter().all(|s| s.action == Action::NoChange)
    }

    pub fn count(&self, action: Action) -> usize {
        self.uninstalls.iter().chain(self.applies.iter()).filter(|s| s.action == action).count()
    }
}

fn validate(set: &[Component], which: &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for c in set {
        if c.name.is_empty() || c.namespace.is_empty() {
            return Err(Error::InvalidConfig(format!("{} component with empty name or namespace: {:?}/{:?}", which, c.namespace, c.name)));
        }
        if c.chart_ref.is_empty() {
            return Err(Error::InvalidConfig(format!("{} component {} has no chart reference", which, c.key())));
        }
        if !seen.insert(c.key()) {
            return Err(Error::InvalidConfig(format!("{} set lists {} more than once", which, c.key())));
        }
    }
    Ok(())
}

// Distinct components must not share a condition type, or the second one
// would be skipped as already done.
fn validate_condition_types(previous: &[Component], desired: &[Component]) -> Result<()> {
    let mut owners: BTreeMap<String, ComponentKey> = BTreeMap::new();
    for c in previous.iter().chain(desired.iter()) {
        let key = c.key();
        match owners.get(&c.condition_type()) {
            Some(owner) if *owner != key => {
                return Err(Error::InvalidConfig(format!("{} and {} share condition type {}", owner, key, c.condition_type())));
            }
            Some(_) => {}
            None => {
                owners.insert(c.condition_type(), key);
            }
        }
    }
    Ok(())
}

/// Diff `previous` against `desired`.
///
/// Desired-only components install, previous-only uninstall, components in
/// both upgrade when they differ (or force an upgrade) and are left alone
/// otherwise.
pub fn diff(previous: &[Component], desired: &[Component]) -> Result<Plan> {
    validate(previous, "previous")?;
    validate(desired, "desired")?;
    validate_condition_types(previous, desired)?;

    let prev_index: BTreeMap<ComponentKey, &Component> = previous.iter().map(|c| (c.key(), c)).collect();
    let desired_keys: BTreeSet<ComponentKey> = desired.iter().map(Component::key).collect();

    let mut applies: Vec<Step> = desired
        .iter()
        .map(|c| match prev_index.get(&c.key()) {
            None => Step::new(Action::Install, c),
            Some(prev) if !prev.same_release(c) || c.force_upgrade => Step::new(Action::Upgrade, c),
            Some(_) => Step::new(Action::NoChange, c),
        })
        .collect();
    applies.sort_by_key(|s| (s.component.order, s.action.rank()));

    let mut uninstalls: Vec<Step> = previous
        .iter()
        .filter(|c| !desired_keys.contains(&c.key()))
        .map(|c| Step::new(Action::Uninstall, c))
        .collect();
    uninstalls.sort_by_key(|s| s.component.order);

    Ok(Plan { uninstalls, applies })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comp(ns: &str, name: &str, order: i32) -> Component {
        Component::new(ns, name, format!("repo/{}", name), "1.0.0").with_order(order)
    }

    fn actions(plan: &Plan) -> Vec<(Action, String)> {
        plan.ordered().into_iter().map(|s| (s.action, s.component.key().to_string())).collect()
    }

    #[test]
    fn classifies_each_key() {
        let prev = vec![comp("a", "keep", 1), comp("a", "bump", 2), comp("a", "gone", 3)];
        let desired = vec![comp("a", "keep", 1), comp("a", "bump", 2).with_values(json!({"x": 1})), comp("a", "new", 4)];
        let plan = diff(&prev, &desired).unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                (Action::Uninstall, "a/gone".to_string()),
                (Action::NoChange, "a/keep".to_string()),
                (Action::Upgrade, "a/bump".to_string()),
                (Action::Install, "a/new".to_string()),
            ]
        );
    }

    #[test]
    fn worked_example() {
        let prev = vec![comp("a", "x", 1), comp("b", "y", 2)];
        let desired = vec![comp("a", "x", 1).with_values(json!("v2")), comp("c", "z", 1)];
        let plan = diff(&prev, &desired).unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                (Action::Uninstall, "b/y".to_string()),
                (Action::Install, "c/z".to_string()),
                (Action::Upgrade, "a/x".to_string()),
            ]
        );
    }

    #[test]
    fn uninstalls_run_in_reverse_order() {
        let prev = vec![comp("s", "storage", 1), comp("s", "registry", 2), comp("s", "console", 3)];
        let plan = diff(&prev, &[]).unwrap();
        let order: Vec<_> = plan.ordered().iter().map(|s| s.component.name.clone()).collect();
        assert_eq!(order, vec!["console", "registry", "storage"]);
    }

    #[test]
    fn order_change_alone_is_no_change() {
        let prev = vec![comp("a", "x", 1)];
        let desired = vec![comp("a", "x", 5)];
        let plan = diff(&prev, &desired).unwrap();
        assert_eq!(plan.count(Action::NoChange), 1);
        assert!(plan.is_noop());
    }

    #[test]
    fn force_upgrade_upgrades_identical() {
        let prev = vec![comp("a", "x", 1).with_force_upgrade(true)];
        let desired = prev.clone();
        assert_eq!(diff(&prev, &desired).unwrap().count(Action::Upgrade), 1);
    }

    #[test]
    fn namespace_move_is_two_units() {
        let prev = vec![comp("old", "x", 1)];
        let desired = vec![comp("new", "x", 1)];
        let plan = diff(&prev, &desired).unwrap();
        assert_eq!(actions(&plan), vec![(Action::Uninstall, "old/x".to_string()), (Action::Install, "new/x".to_string())]);
    }

    #[test]
    fn duplicates_are_invalid_config() {
        let desired = vec![comp("a", "x", 1), comp("a", "x", 2)];
        let err = diff(&[], &desired).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn empty_chart_ref_is_invalid() {
        let mut c = comp("a", "x", 1);
        c.chart_ref.clear();
        assert!(matches!(diff(&[], &[c]), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn colliding_condition_types_are_invalid() {
        let desired = vec![comp("kube-system", "metrics", 1), comp("kube", "system-metrics", 2)];
        assert!(matches!(diff(&[], &desired), Err(Error::InvalidConfig(_))));

        // across sets too: the uninstall and the install would share a condition
        let prev = vec![comp("kube-system", "metrics", 1)];
        let desired = vec![comp("kube", "system-metrics", 1)];
        let err = diff(&prev, &desired).unwrap_err();
        assert!(err.to_string().contains("kube-system-metrics"));
    }

    #[test]
    fn same_component_in_both_sets_is_fine() {
        let prev = vec![comp("kube-system", "metrics", 1)];
        assert_eq!(diff(&prev, &prev).unwrap().count(Action::NoChange), 1);
    }
}
