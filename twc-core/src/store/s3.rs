//! S3-compatible object store client.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use bytes::Bytes;
use tracing::debug;

use super::{ByteRange, ByteStream, ObjectStore, StoreError};
use crate::config::StoreConfig;

/// Object store backed by an S3-compatible service.
///
/// Uses path-style addressing so that self-hosted endpoints work without
/// wildcard DNS.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Builds a client with static credentials from the store configuration.
    ///
    /// # Errors
    ///
    /// - `StoreError::Configuration` - If credentials are missing
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        else {
            return Err(StoreError::Configuration {
                reason: "access key id and secret access key are required".to_string(),
            });
        };

        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "torrent-web-cache",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self::new(aws_sdk_s3::Client::from_conf(builder.build())))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ByteStream>, StoreError> {
        debug!("S3 GET {}/{} range={:?}", bucket, key, range);
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|range| range.header_value()))
            .send()
            .await;

        match result {
            Ok(response) => Ok(Some(Box::pin(response.body.into_async_read()))),
            Err(SdkError::ServiceError(err))
                if matches!(err.err(), GetObjectError::NoSuchKey(_))
                    || err.err().code() == Some("NoSuchKey") =>
            {
                Ok(None)
            }
            Err(err) => Err(StoreError::Request {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: DisplayErrorContext(&err).to_string(),
            }),
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        debug!("S3 PUT {}/{} ({} bytes)", bucket, key, body.len());
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|err| StoreError::Request {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_is_configuration_error() {
        let config = StoreConfig::default();
        assert!(matches!(
            S3ObjectStore::from_config(&config),
            Err(StoreError::Configuration { .. })
        ));
    }

    #[test]
    fn test_client_builds_with_custom_endpoint() {
        let config = StoreConfig {
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            ..StoreConfig::default()
        };
        assert!(S3ObjectStore::from_config(&config).is_ok());
    }
}
