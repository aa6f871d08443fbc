//! Outpost core types: chart-backed components, status conditions and the
//! installation record the reconcilers report into.

#![forbid(unsafe_code)]

pub mod component;
pub mod condition;
pub mod error;
pub mod hash;
pub mod installation;

pub use component::{apply_override, Component, ComponentKey};
pub use condition::{sanitize_message, Condition, ConditionSet, ConditionStatus};
pub use error::{Error, Result};
pub use hash::{content_hash, name_with_length_limit, MAX_NAME_LEN};
pub use installation::{ArtifactsLocation, Installation, InstallationSpec, InstallationStatus};

pub mod prelude {
    pub use super::{Component, ComponentKey, Condition, ConditionSet, ConditionStatus, Installation};
}
