//! S3-compatible object store backed by the AWS SDK, addressed path-style so
//! in-cluster stores without virtual-host DNS work.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::migrate_data::ObjectStore;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(endpoint: &str, region: impl Into<String>, creds: S3Credentials) -> Result<Self> {
        check_endpoint(endpoint)?;
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(Region::new(region.into()))
            .credentials_provider(Credentials::new(creds.access_key_id, creds.secret_access_key, None, None, "outpost"))
            .force_path_style(true)
            .build();
        Ok(Self { client: aws_sdk_s3::Client::from_conf(conf) })
    }

    /// `S3_ENDPOINT`, `S3_REGION` (default `us-east-1`), `S3_ACCESS_KEY_ID`,
    /// `S3_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Result<Self> {
        let var = |k: &str| std::env::var(k).with_context(|| format!("{} is not set", k));
        let creds = S3Credentials { access_key_id: var("S3_ACCESS_KEY_ID")?, secret_access_key: var("S3_SECRET_ACCESS_KEY")? };
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Self::new(&var("S3_ENDPOINT")?, region, creds)
    }
}

fn check_endpoint(endpoint: &str) -> Result<()> {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .ok_or_else(|| anyhow!("S3 endpoint {} must start with http:// or https://", endpoint))?;
    if rest.split(['/', ':']).next().unwrap_or_default().is_empty() {
        return Err(anyhow!("S3 endpoint {} has no host", endpoint));
    }
    Ok(())
}

/// Bucket creation errors that mean the bucket is already there.
fn bucket_already_present(e: &CreateBucketError) -> bool {
    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket, "bucket created");
                Ok(())
            }
            Err(e) if e.as_service_error().map(bucket_already_present).unwrap_or(false) => {
                debug!(bucket, "bucket already exists");
                Ok(())
            }
            Err(e) => Err(anyhow!("creating bucket {}: {}", bucket, DisplayErrorContext(&e))),
        }
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path).await.with_context(|| format!("opening {}", path.display()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key.trim_start_matches('/'))
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("put {}/{}: {}", bucket, key, DisplayErrorContext(&e)))?;
        Ok(())
    }
}
