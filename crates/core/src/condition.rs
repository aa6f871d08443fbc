//! Named status conditions keyed by type.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Longest message kept on a condition.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>, observed_generation: i64) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True }
}

/// Conditions keyed by `type`; at most one condition per type.
///
/// Serialized as a list so it lands as `status.conditions: [...]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Condition>", into = "Vec<Condition>")]
pub struct ConditionSet {
    inner: BTreeMap<String, Condition>,
}

impl ConditionSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.inner.len() }
    pub fn is_empty(&self) -> bool { self.inner.is_empty() }

    pub fn get(&self, type_: &str) -> Option<&Condition> { self.inner.get(type_) }

    /// Upsert. The transition time only moves when the status flips.
    pub fn set(&mut self, mut cond: Condition) {
        if let Some(prev) = self.inner.get(&cond.type_) {
            if prev.status == cond.status {
                cond.last_transition_time = prev.last_transition_time;
            }
        }
        self.inner.insert(cond.type_.clone(), cond);
    }

    pub fn remove(&mut self, type_: &str) -> Option<Condition> { self.inner.remove(type_) }

    pub fn is_true(&self, type_: &str) -> bool {
        self.inner.get(type_).map(Condition::is_true).unwrap_or(false)
    }

    /// True and recorded against `generation`.
    pub fn is_true_for(&self, type_: &str, generation: i64) -> bool {
        self.inner.get(type_).map(|c| c.is_true() && c.observed_generation == generation).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> { self.inner.values() }
}

impl From<Vec<Condition>> for ConditionSet {
    fn from(list: Vec<Condition>) -> Self {
        let mut set = ConditionSet::new();
        for c in list { set.inner.insert(c.type_.clone(), c); }
        set
    }
}

impl From<ConditionSet> for Vec<Condition> {
    fn from(set: ConditionSet) -> Self { set.inner.into_values().collect() }
}

/// Flatten an error chain into a single condition-safe line.
pub fn sanitize_message(msg: &str) -> String {
    let flat = msg.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_MESSAGE_LEN {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_MESSAGE_LEN - 3).collect();
    cut.push_str("...");
    cut
}
