//! Error taxonomy shared by the reconcilers.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Structurally impossible configuration; retrying cannot help.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A single component's apply call failed; the rest of the pass was skipped.
    #[error("{verb} {key} failed: {source:#}")]
    Unit {
        key: String,
        verb: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("cluster request failed: {0:#}")]
    Cluster(#[source] anyhow::Error),

    #[error("failed to persist status: {0:#}")]
    Status(#[source] anyhow::Error),

    /// A one-shot job reported failure and needs operator attention.
    #[error("job {0} failed")]
    JobFailed(String),
}

impl Error {
    /// Whether a later pass may succeed without anyone changing the config.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::JobFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_is_not_retryable() {
        assert!(!Error::InvalidConfig("dup".into()).is_retryable());
        assert!(!Error::JobFailed("registry-data-migration".into()).is_retryable());
        assert!(Error::Cluster(anyhow::anyhow!("timeout")).is_retryable());
    }

    #[test]
    fn unit_error_renders_chain() {
        let e = Error::Unit { key: "a/x".into(), verb: "install", source: anyhow::anyhow!("exit 1").context("helm upgrade") };
        assert_eq!(e.to_string(), "install a/x failed: helm upgrade: exit 1");
    }
}
