//! S3-compatible object storage backend.

use super::{Origin, PresignedUrl, RemoteConnector, SourceBackend, SourceRef, is_image_name};
use crate::credentials::Credentials;
use crate::error::{BatchError, Result};
use async_trait::async_trait;
use aws_sdk_s3 as aws_s3;
use aws_s3::config::Region;
use aws_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_s3::presigning::PresigningConfig;
use aws_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const CREDENTIALS_PROVIDER_NAME: &str = "idenhide";

/// Maps an SDK failure onto the orchestrator taxonomy by its error code.
fn classify<E, R>(err: &SdkError<E, R>, target: &str) -> BatchError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{target}: {}", DisplayErrorContext(err));
    match err.code() {
        Some(
            "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" | "InvalidToken"
            | "TokenRefreshRequired",
        ) => BatchError::CredentialsInvalid(message),
        Some("AccessDenied" | "AllAccessDisabled" | "Forbidden") => BatchError::AccessDenied(message),
        Some("NoSuchKey" | "NotFound") => BatchError::NotFound(message),
        Some("NoSuchBucket") => BatchError::SourceUnavailable(message),
        _ => BatchError::FetchFailed(message),
    }
}

fn remote_parts(location: &SourceRef) -> Result<(&str, &str)> {
    match location {
        SourceRef::Remote { bucket, key, .. } => Ok((bucket, key)),
        SourceRef::Local { .. } => Err(BatchError::Unsupported(format!(
            "S3 backend cannot reach local path {location}"
        ))),
    }
}

/// Object storage reached through `aws-sdk-s3`.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: aws_s3::Client,
    region: String,
}

impl S3Backend {
    /// Builds a client for `region` authenticated with `credentials`.
    ///
    /// `endpoint_url` targets an S3-compatible service instead of AWS and
    /// switches to path-style addressing.
    pub async fn connect(region: &str, credentials: Credentials, endpoint_url: Option<&str>) -> Self {
        let provider = aws_s3::config::Credentials::new(
            credentials.access_key_id(),
            credentials.secret_access_key(),
            credentials.session_token().map(str::to_string),
            None,
            CREDENTIALS_PROVIDER_NAME,
        );
        drop(credentials);

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(provider)
            .load()
            .await;

        let mut builder = aws_s3::config::Builder::from(&sdk_config);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }

        info!(region, endpoint = endpoint_url.unwrap_or("aws"), "S3 backend initialized");
        Self { client: aws_s3::Client::from_conf(builder.build()), region: region.to_string() }
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl SourceBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    /// Calls `ListBuckets`. Rejected keys fail; a principal that merely lacks
    /// the list-all-buckets permission passes.
    async fn verify(&self) -> Result<()> {
        match self.client.list_buckets().send().await {
            Ok(output) => {
                debug!(buckets = output.buckets().len(), "S3 credentials verified");
                Ok(())
            }
            Err(err) => match classify(&err, "credential check") {
                BatchError::AccessDenied(message) => {
                    debug!(%message, "ListBuckets denied; credentials accepted");
                    Ok(())
                }
                BatchError::FetchFailed(message) => Err(BatchError::SourceUnavailable(message)),
                other => Err(other),
            },
        }
    }

    async fn list(&self, origin: &Origin) -> Result<Vec<SourceRef>> {
        let Origin::Remote(location) = origin else {
            return Err(BatchError::Unsupported(format!(
                "S3 backend cannot list {}",
                origin.describe()
            )));
        };
        let prefix = location.folder_prefix();
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&location.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|err| match classify(&err, &location.uri()) {
                    auth @ (BatchError::AccessDenied(_) | BatchError::CredentialsInvalid(_)) => auth,
                    other => BatchError::SourceUnavailable(other.to_string()),
                })?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| is_image_name(key))
                    .map(str::to_string),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        debug!(bucket = %location.bucket, prefix = %prefix, count = keys.len(), "Listed S3 prefix");
        Ok(keys
            .into_iter()
            .map(|key| SourceRef::remote(&location.bucket, key, &location.region))
            .collect())
    }

    async fn get(&self, location: &SourceRef) -> Result<Bytes> {
        let (bucket, key) = remote_parts(location)?;
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify(&err, &location.uri()))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| BatchError::FetchFailed(format!("{location}: failed to read body: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn put(&self, location: &SourceRef, bytes: Bytes, content_type: &str) -> Result<()> {
        let (bucket, key) = remote_parts(location)?;
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| classify(&err, &location.uri()))?;
        debug!(bucket, key, size, "Uploaded object to S3");
        Ok(())
    }

    async fn presign(&self, location: &SourceRef, ttl: Duration) -> Result<PresignedUrl> {
        let (bucket, key) = remote_parts(location)?;

        // Presigning is offline; confirm the key exists and is readable first.
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify(&err, &location.uri()))?;

        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| BatchError::InvalidConfig(format!("invalid presign TTL: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .response_content_type("image/jpeg")
            .response_content_disposition("inline")
            .presigned(config)
            .await
            .map_err(|err| classify(&err, &location.uri()))?;

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BatchError::InvalidConfig(format!("invalid presign TTL: {e}")))?;
        Ok(PresignedUrl { url: request.uri().to_string(), expires_at: Utc::now() + ttl })
    }
}

/// Opens [`S3Backend`]s and verifies their credentials.
#[derive(Debug, Clone, Default)]
pub struct S3Connector {
    endpoint_url: Option<String>,
}

impl S3Connector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets an S3-compatible endpoint instead of AWS.
    #[must_use]
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }
}

#[async_trait]
impl RemoteConnector for S3Connector {
    async fn connect(&self, region: &str, credentials: Credentials) -> Result<Arc<dyn SourceBackend>> {
        let backend = S3Backend::connect(region, credentials, self.endpoint_url.as_deref()).await;
        backend.verify().await?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_parts_rejects_local() {
        let err = remote_parts(&SourceRef::local("/tmp/a.jpg")).unwrap_err();
        assert!(matches!(err, BatchError::Unsupported(_)));

        let location = SourceRef::remote("photos", "in/a.jpg", "us-east-1");
        assert_eq!(remote_parts(&location).unwrap(), ("photos", "in/a.jpg"));
    }

    #[tokio::test]
    async fn test_connector_uses_custom_endpoint() {
        let backend = S3Backend::connect(
            "eu-west-1",
            Credentials::new("AKIAEXAMPLE", "secret", None),
            Some("http://127.0.0.1:9000"),
        )
        .await;
        assert_eq!(backend.region(), "eu-west-1");
        assert_eq!(backend.name(), "s3");
    }
}
