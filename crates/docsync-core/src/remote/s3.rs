//! S3-compatible blob store (AWS S3, Cloudflare R2, MinIO).

use std::env;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;

use crate::util::normalize_text_option;
use crate::{Error, Result};

use super::{BlobStore, RemoteError, RemoteResult};

const ENV_BUCKET: &str = "DOCSYNC_S3_BUCKET";
const ENV_REGION: &str = "DOCSYNC_S3_REGION";
const ENV_ENDPOINT: &str = "DOCSYNC_S3_ENDPOINT";
const ENV_ACCESS_KEY_ID: &str = "DOCSYNC_S3_ACCESS_KEY_ID";
const ENV_SECRET_ACCESS_KEY: &str = "DOCSYNC_S3_SECRET_ACCESS_KEY";
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3-compatible bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible providers; `None` targets AWS
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Config {
    /// Load configuration from `DOCSYNC_S3_*` environment variables.
    ///
    /// Returns `Ok(None)` when none of the variables are set and an error when
    /// only some of the required ones are.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }
}

/// Blob store backed by one S3 bucket; object paths are used as keys.
#[derive(Clone, Debug)]
pub struct S3BlobStore {
    config: S3Config,
    client: Client,
}

impl S3BlobStore {
    #[must_use]
    pub fn new(config: S3Config) -> Self {
        let client = build_s3_client(&config);
        Self { config, client }
    }

    #[must_use]
    pub const fn config(&self) -> &S3Config {
        &self.config
    }

    /// Check that the bucket is reachable with the configured credentials.
    pub async fn bucket_is_reachable(&self) -> RemoteResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|error| remote_error("head_bucket", &self.config.bucket, &error))?;
        Ok(())
    }

    fn target(&self, key: &str) -> String {
        format!("{}/{key}", self.config.bucket)
    }
}

impl BlobStore for S3BlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> RemoteResult<()> {
        let key = normalize_object_key(path)?;
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|error| remote_error("put_object", &self.target(&key), &error))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let key = normalize_object_key(path)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| remote_error("get_object", &self.target(&key), &error))?;

        let payload = response.body.collect().await.map_err(|error| {
            RemoteError::Transient(format!(
                "S3 get_object body failed for {}: {error}",
                self.target(&key)
            ))
        })?;
        Ok(payload.into_bytes().to_vec())
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        let key = normalize_object_key(path)?;
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| remote_error("delete_object", &self.target(&key), &error))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        Ok(self.size(path).await?.is_some())
    }

    async fn size(&self, path: &str) -> RemoteResult<Option<u64>> {
        let key = normalize_object_key(path)?;
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(
                response
                    .content_length()
                    .and_then(|length| u64::try_from(length).ok())
                    .unwrap_or_default(),
            )),
            Err(error) => match remote_error("head_object", &self.target(&key), &error) {
                RemoteError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<S3Config>> {
    let bucket = normalize_text_option(lookup(ENV_BUCKET));
    let region = normalize_text_option(lookup(ENV_REGION));
    let endpoint_url = normalize_text_option(lookup(ENV_ENDPOINT));
    let access_key_id = normalize_text_option(lookup(ENV_ACCESS_KEY_ID));
    let secret_access_key = normalize_text_option(lookup(ENV_SECRET_ACCESS_KEY));

    let any_present = bucket.is_some()
        || region.is_some()
        || endpoint_url.is_some()
        || access_key_id.is_some()
        || secret_access_key.is_some();
    if !any_present {
        return Ok(None);
    }

    let (Some(bucket), Some(access_key_id), Some(secret_access_key)) =
        (bucket.clone(), access_key_id.clone(), secret_access_key.clone())
    else {
        let missing: Vec<&str> = [
            (ENV_BUCKET, bucket.is_none()),
            (ENV_ACCESS_KEY_ID, access_key_id.is_none()),
            (ENV_SECRET_ACCESS_KEY, secret_access_key.is_none()),
        ]
        .into_iter()
        .filter_map(|(name, is_missing)| is_missing.then_some(name))
        .collect();
        return Err(Error::InvalidInput(format!(
            "S3 configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    };

    Ok(Some(S3Config {
        bucket,
        region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        endpoint_url: normalize_endpoint(endpoint_url)?,
        access_key_id,
        secret_access_key,
    }))
}

fn normalize_endpoint(endpoint_url: Option<String>) -> Result<Option<String>> {
    let Some(value) = endpoint_url else {
        return Ok(None);
    };
    if !value.starts_with("https://") && !value.starts_with("http://") {
        return Err(Error::InvalidInput(format!(
            "{ENV_ENDPOINT} must start with http:// or https://"
        )));
    }
    Ok(Some(value.trim_end_matches('/').to_string()))
}

fn build_s3_client(config: &S3Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "docsync-s3-blob-store",
    );

    let mut builder = aws_sdk_s3::config::Builder::new()
        .region(Region::new(config.region.clone()))
        .credentials_provider(credentials);
    if let Some(endpoint_url) = &config.endpoint_url {
        builder = builder.endpoint_url(endpoint_url).force_path_style(true);
    }

    Client::from_conf(builder.build())
}

fn remote_error<E>(
    operation: &str,
    target: &str,
    error: &SdkError<E, HttpResponse>,
) -> RemoteError {
    let message = format!("S3 {operation} failed for {target}: {error}");
    match error {
        SdkError::ServiceError(service) => {
            RemoteError::from_status(service.raw().status().as_u16(), message)
        }
        SdkError::ResponseError(response) => {
            RemoteError::from_status(response.raw().status().as_u16(), message)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            RemoteError::Transient(message)
        }
        _ => RemoteError::Validation(message),
    }
}

fn normalize_object_key(path: &str) -> RemoteResult<String> {
    let key = path.trim().trim_matches('/');
    if key.is_empty() {
        return Err(RemoteError::Validation(
            "object key cannot be empty".to_string(),
        ));
    }
    Ok(key.to_string())
}
