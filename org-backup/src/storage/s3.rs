//! S3 (and S3-compatible) backend.

use crate::config::StorageConfig;
use crate::credentials::StorageCredentials;
use crate::storage::{ObjectMeta, ObjectStore};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Used when neither the configuration nor the credentials name a region
const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Store {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Store {
    pub async fn new(config: &StorageConfig, credentials: Option<&StorageCredentials>) -> Result<Self> {
        let region = config
            .region
            .clone()
            .or_else(|| credentials.and_then(|c| c.region.clone()))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        // every attempt is bounded; retries belong to RetryPolicy alone
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .operation_attempt_timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build();

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .force_path_style(config.path_style)
            .timeout_config(timeouts)
            .retry_config(RetryConfig::disabled());

        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let Some(creds) = credentials {
            builder = builder.credentials_provider(Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                "secret-document",
            ));
        } else {
            // default chain: environment, profile, instance/task role
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .load()
                .await;
            if let Some(provider) = sdk_config.credentials_provider() {
                builder = builder.credentials_provider(provider);
            }
        }

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            region,
        })
    }
}

/// Throttling, server errors and transport failures are worth another try;
/// everything else (access denied, missing bucket, bad request) is not.
fn classify_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> BackupError
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status >= 500
                || status == 429
                || matches!(ctx.err().code(), Some("SlowDown" | "RequestTimeout" | "InternalError"))
        }
        _ => false,
    };
    BackupError::Storage {
        message: format!("{} failed: {}", operation, DisplayErrorContext(&err)),
        retryable,
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(|e| BackupError::Storage {
            message: format!("cannot read {}: {}", path.display(), e),
            retryable: false,
        })?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(meta.content_type);
        if let Some(encoding) = meta.content_encoding {
            request = request.content_encoding(encoding);
        }

        request
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_object", e))?;
        debug!(bucket = %self.bucket, key, "Stored object");
        Ok(())
    }

    async fn ensure_container(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "Bucket exists");
                Ok(())
            }
            Err(SdkError::ServiceError(ctx)) if ctx.raw().status().as_u16() == 404 => {
                info!(bucket = %self.bucket, region = %self.region, "Bucket not found, creating it");
                let mut request = self.client.create_bucket().bucket(&self.bucket);
                // us-east-1 rejects an explicit location constraint
                if self.region != DEFAULT_REGION {
                    let constraint = aws_sdk_s3::types::BucketLocationConstraint::from(self.region.as_str());
                    request = request.create_bucket_configuration(
                        aws_sdk_s3::types::CreateBucketConfiguration::builder()
                            .location_constraint(constraint)
                            .build(),
                    );
                }
                request.send().await.map_err(|e| {
                    BackupError::StorageSetup(format!(
                        "cannot create bucket {}: {}",
                        self.bucket,
                        DisplayErrorContext(&e)
                    ))
                })?;
                Ok(())
            }
            Err(e) => Err(BackupError::StorageSetup(format!(
                "cannot access bucket {}: {}",
                self.bucket,
                DisplayErrorContext(&e)
            ))),
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
