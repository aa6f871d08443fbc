//! Outpost ops: the node artifact reconciler and the registry migration
//! orchestrator, plus the migration procedure the orchestrator's job runs.

#![forbid(unsafe_code)]

pub mod artifacts;
pub mod migrate_data;
pub mod migration;
pub mod s3;

pub use artifacts::{ensure_artifacts_job_for_nodes, list_artifacts_job_for_nodes, ArtifactsJobConfig};
pub use migrate_data::{MigrateDataConfig, MigrationReport, ObjectStore};
pub use migration::{migrate_registry_data, MigrationConfig, MigrationState, MIGRATION_CONDITION};
pub use s3::{S3Credentials, S3Store};
