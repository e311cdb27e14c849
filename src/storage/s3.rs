//! S3-compatible storage backend using AWS SDK.

use crate::config::S3Config;
use crate::storage::post_policy::{PostPolicy, SigningCredentials};
use crate::storage::{ObjectMeta, ObjectStore, PresignedPost, SizeRange, StoreError, StoreResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use tracing::instrument;

/// Characters left unescaped in an `x-amz-copy-source` path.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn map_s3_operation_error<E>(err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::S3(Box::new(err))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

/// S3-compatible object store using AWS SDK.
pub struct S3Store {
    client: Client,
    credentials: SharedCredentialsProvider,
    bucket: String,
    /// Normalized endpoint, `None` for AWS itself.
    endpoint: Option<String>,
    region: String,
    force_path_style: bool,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("force_path_style", &self.force_path_style)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Create a new S3 store.
    ///
    /// Explicit credentials must be given as a pair; without them the ambient
    /// AWS credential chain is used.
    pub async fn new(config: &S3Config) -> StoreResult<Self> {
        let (access_key_id, secret_access_key) =
            match (&config.access_key_id, &config.secret_access_key) {
                (Some(id), Some(secret)) => (Some(id.clone()), Some(secret.clone())),
                (None, None) => (None, None),
                _ => {
                    return Err(StoreError::Config(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ));
                }
            };

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let credentials = match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => SharedCredentialsProvider::new(Credentials::new(
                key_id,
                secret,
                None,
                None,
                "scheduler-avatars-config",
            )),
            _ => SharedCredentialsProvider::new(
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(aws_config::Region::new(region.clone()))
                    .build()
                    .await,
            ),
        };

        // Bare host:port endpoints (e.g. "minio:9000") get http://
        let endpoint = config.endpoint.as_ref().map(|url| {
            let lower = url.to_lowercase();
            let url = if lower.starts_with("http://") || lower.starts_with("https://") {
                url.clone()
            } else {
                format!("http://{url}")
            };
            url.trim_end_matches('/').to_string()
        });

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .credentials_provider(credentials.clone());
        if let Some(url) = &endpoint {
            builder = builder.endpoint_url(url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            credentials,
            bucket: config.bucket.clone(),
            endpoint,
            region,
            force_path_style: config.force_path_style,
        })
    }

    /// Form action URL for browser POST uploads into the bucket.
    pub fn post_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) if self.force_path_style => format!("{endpoint}/{}", self.bucket),
            Some(endpoint) => match endpoint.split_once("://") {
                Some((scheme, host)) => format!("{scheme}://{}.{host}", self.bucket),
                None => format!("{endpoint}/{}", self.bucket),
            },
            None => format!("https://{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    async fn signing_credentials(&self) -> StoreResult<SigningCredentials> {
        let creds = self
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| StoreError::Config(format!("resolving S3 credentials: {e}")))?;
        Ok(SigningCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().map(str::to_string),
            region: self.region.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn stat(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMeta {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                last_modified: output
                    .last_modified()
                    .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), 0)),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        let source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(from, COPY_SOURCE)
        );
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(to)
            .send()
            .await
            .map_err(|err| {
                if is_not_found(&err) {
                    StoreError::NotFound(from.to_string())
                } else {
                    map_s3_operation_error(err)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        // delete_object succeeds on missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_get(&self, key: &str, ttl: Duration) -> StoreResult<String> {
        let config =
            PresigningConfig::expires_in(ttl).map_err(|e| StoreError::Signing(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(map_s3_operation_error)?;
        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign_post_policy(
        &self,
        key: &str,
        ttl: Duration,
        size: SizeRange,
    ) -> StoreResult<PresignedPost> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Signing(e.to_string()))?;
        let policy = PostPolicy {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            expires_at,
            content_length: size,
        };
        let fields = policy.sign(&self.signing_credentials().await?, now)?;
        Ok(PresignedPost {
            url: self.post_url(),
            fields,
            expires_at,
        })
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>, force_path_style: bool) -> S3Config {
        S3Config {
            bucket: "avatars".into(),
            endpoint: endpoint.map(str::to_string),
            region: Some("eu-west-1".into()),
            access_key_id: Some("AKIDEXAMPLE".into()),
            secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into()),
            force_path_style,
        }
    }

    #[tokio::test]
    async fn rejects_partial_credentials() {
        let mut cfg = config(None, false);
        cfg.secret_access_key = None;
        let err = S3Store::new(&cfg).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn post_url_follows_addressing_style() {
        let aws = S3Store::new(&config(None, false)).await.unwrap();
        assert_eq!(aws.post_url(), "https://avatars.s3.eu-west-1.amazonaws.com");

        let minio = S3Store::new(&config(Some("minio:9000"), true)).await.unwrap();
        assert_eq!(minio.post_url(), "http://minio:9000/avatars");

        let hosted = S3Store::new(&config(Some("https://objects.example.com/"), false))
            .await
            .unwrap();
        assert_eq!(hosted.post_url(), "https://avatars.objects.example.com");
    }

    #[tokio::test]
    async fn presigned_post_is_pinned_to_key() {
        let store = S3Store::new(&config(Some("http://minio:9000"), true))
            .await
            .unwrap();
        let post = store
            .presign_post_policy(
                "pending/avatars/a.webp",
                Duration::from_secs(180),
                SizeRange { min: 1, max: 2048 },
            )
            .await
            .unwrap();

        assert_eq!(post.url, "http://minio:9000/avatars");
        assert_eq!(post.fields["key"], "pending/avatars/a.webp");
        assert!(
            post.fields["x-amz-credential"].starts_with("AKIDEXAMPLE/")
                && post.fields["x-amz-credential"].ends_with("/eu-west-1/s3/aws4_request")
        );
        assert!(post.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn presigned_get_carries_signature() {
        let store = S3Store::new(&config(Some("http://minio:9000"), true))
            .await
            .unwrap();
        let url = store
            .presign_get("avatars/a.webp", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(url.starts_with("http://minio:9000/avatars/avatars/a.webp?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=60"));
    }
}
