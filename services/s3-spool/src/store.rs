use crate::config::OutputConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by an object store write
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to put object {key}: {message}")]
    PutFailed { key: String, message: String },
}

/// Canned access policy attached to each uploaded object
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Acl {
    Private,
    #[default]
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl Acl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acl::Private => "private",
            Acl::PublicRead => "public-read",
            Acl::PublicReadWrite => "public-read-write",
            Acl::AuthenticatedRead => "authenticated-read",
            Acl::BucketOwnerRead => "bucket-owner-read",
            Acl::BucketOwnerFullControl => "bucket-owner-full-control",
        }
    }

    fn to_canned(self) -> ObjectCannedAcl {
        match self {
            Acl::Private => ObjectCannedAcl::Private,
            Acl::PublicRead => ObjectCannedAcl::PublicRead,
            Acl::PublicReadWrite => ObjectCannedAcl::PublicReadWrite,
            Acl::AuthenticatedRead => ObjectCannedAcl::AuthenticatedRead,
            Acl::BucketOwnerRead => ObjectCannedAcl::BucketOwnerRead,
            Acl::BucketOwnerFullControl => ObjectCannedAcl::BucketOwnerFullControl,
        }
    }
}

/// Write-only view of a remote object store.
///
/// A `put` either stores the whole object or fails; callers never have to
/// reconcile a partially written object.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        acl: Acl,
    ) -> Result<(), StoreError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a new S3 object store for the configured bucket
    pub async fn new(config: &OutputConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if config.has_static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "s3-spool-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            static_credentials = config.has_static_credentials(),
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        acl: Acl,
    ) -> Result<(), StoreError> {
        debug!(key = %key, acl = acl.as_str(), "Putting object");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .acl(acl.to_canned())
            .send()
            .await
            .map_err(|e| StoreError::PutFailed {
                key: key.to_string(),
                message: aws_sdk_s3::error::DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}
