//! Object store ("vault") client used by the publish stage.
//!
//! Bucket listing and creation are raw SigV4-signed requests against the
//! S3-compatible endpoint (path-style); object uploads go through
//! `object_store`'s S3 client with retries disabled.

use async_trait::async_trait;
use object_store::aws::{AmazonS3Builder, AwsAuthorizer, AwsCredential};
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, RetryConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::StoreConfig;

static S3_ERROR_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Code>([^<]+)</Code>").expect("static regex"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store credentials missing (set AWS_ACCESS_KEY and AWS_SECRET_KEY)")]
    MissingCredentials,
    #[error("invalid object store endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("could not connect to object store at {endpoint}: {source}")]
    Unreachable { endpoint: String, #[source] source: reqwest::Error },
    #[error("object store at {endpoint} rejected the request: HTTP {status} {code}")]
    Rejected { endpoint: String, status: u16, code: String },
    #[error("bucket '{bucket}' could not be created: HTTP {status} {code}")]
    BucketCreation { bucket: String, status: u16, code: String },
    #[error("'{key}' is not a valid object key: {source}")]
    InvalidKey { key: String, #[source] source: object_store::path::Error },
    #[error("upload of {path} to '{key}' failed: {source}")]
    Upload { path: PathBuf, key: String, #[source] source: std::io::Error },
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("cannot walk artifact directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("object store client: {0}")]
    Client(#[from] object_store::Error),
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus { Created, AlreadyExists }

/// `s3://{bucket}/{prefix}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub bucket: String,
    pub prefix: String,
}

impl StorageUri {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), prefix: prefix.into() }
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "s3://{}/{}", self.bucket, self.prefix) }
}

#[derive(Debug, Error)]
#[error("malformed storage URI '{0}' (expected s3://bucket/prefix)")]
pub struct UriParseError(pub String);

impl FromStr for StorageUri {
    type Err = UriParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bucket, prefix) = s
            .strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| UriParseError(s.to_string()))?;
        if bucket.is_empty() || s.contains(char::is_whitespace) { return Err(UriParseError(s.to_string())); }
        Ok(Self::new(bucket, prefix))
    }
}

/// Destination key for a file at `relative` under the published directory.
pub fn object_key(prefix: &str, relative: &Path) -> String {
    let rel = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() { rel } else { format!("{prefix}/{rel}") }
}

/// Store location for `key`, taken verbatim. `ObjectPath::from` would
/// percent-encode characters such as `~` or `[` and upload under another key.
pub(crate) fn object_path(key: &str) -> Result<ObjectPath, StoreError> {
    ObjectPath::parse(key).map_err(|source| StoreError::InvalidKey { key: key.to_string(), source })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub relative: PathBuf,
}

/// Every regular file under `dir`, in a stable order. Symlinks are followed
/// since hub snapshots link into a blob store.
pub fn artifact_files(dir: &Path) -> Result<Vec<ArtifactFile>, StoreError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() { continue; }
        let relative = entry.path().strip_prefix(dir).map(Path::to_path_buf).unwrap_or_else(|_| PathBuf::from(entry.file_name()));
        files.push(ArtifactFile { path: entry.path().to_path_buf(), relative });
    }
    Ok(files)
}

/// S3 error `<Code>` from an XML error body, falling back to the status reason.
pub(crate) fn error_code(status: StatusCode, body: &str) -> String {
    S3_ERROR_CODE
        .captures(body)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string())
}

pub(crate) fn classify_create_bucket(bucket: &str, status: StatusCode, body: &str) -> Result<BucketStatus, StoreError> {
    if status.is_success() { return Ok(BucketStatus::Created); }
    let code = error_code(status, body);
    match (status, code.as_str()) {
        (StatusCode::CONFLICT, "BucketAlreadyOwnedByYou" | "BucketAlreadyExists") => Ok(BucketStatus::AlreadyExists),
        _ => Err(StoreError::BucketCreation { bucket: bucket.to_string(), status: status.as_u16(), code }),
    }
}

#[async_trait]
pub trait ObjectVault: Send + Sync {
    fn endpoint(&self) -> &str;
    fn bucket(&self) -> &str;
    /// Connectivity check: a signed bucket listing.
    async fn ping(&self) -> Result<(), StoreError>;
    async fn ensure_bucket(&self) -> Result<BucketStatus, StoreError>;
    /// Upload one local file, returning the number of bytes written.
    async fn put_file(&self, key: &str, local: &Path) -> Result<u64, StoreError>;
}

pub struct S3Vault {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    region: String,
    credential: AwsCredential,
    store: Arc<dyn ObjectStore>,
}

impl S3Vault {
    /// Build the clients. No request is sent until [`ObjectVault::ping`].
    pub fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let creds = cfg.credentials.as_ref().ok_or(StoreError::MissingCredentials)?;
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        Url::parse(&endpoint).map_err(|_| StoreError::InvalidEndpoint(cfg.endpoint.clone()))?;
        let store = AmazonS3Builder::new()
            .with_endpoint(&endpoint)
            .with_region(&cfg.region)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&creds.access_key)
            .with_secret_access_key(&creds.secret_key)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false)
            .with_retry(RetryConfig { max_retries: 0, ..Default::default() })
            .build()?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            bucket: cfg.bucket.clone(),
            region: cfg.region.clone(),
            credential: AwsCredential { key_id: creds.access_key.clone(), secret_key: creds.secret_key.clone(), token: None },
            store: Arc::new(store),
        })
    }

    fn url(&self, path: &str) -> Result<Url, StoreError> {
        Url::parse(&format!("{}/{}", self.endpoint, path)).map_err(|_| StoreError::InvalidEndpoint(self.endpoint.clone()))
    }

    async fn signed(&self, method: Method, url: Url, body: Option<String>) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body { builder = builder.body(body); }
        let mut request = builder.build()?;
        AwsAuthorizer::new(&self.credential, "s3", &self.region).authorize(&mut request, None);
        self.http.execute(request).await
    }
}

#[async_trait]
impl ObjectVault for S3Vault {
    fn endpoint(&self) -> &str { &self.endpoint }
    fn bucket(&self) -> &str { &self.bucket }

    async fn ping(&self) -> Result<(), StoreError> {
        let resp = self
            .signed(Method::GET, self.url("")?, None)
            .await
            .map_err(|source| StoreError::Unreachable { endpoint: self.endpoint.clone(), source })?;
        let status = resp.status();
        if status.is_success() { return Ok(()); }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected { endpoint: self.endpoint.clone(), status: status.as_u16(), code: error_code(status, &body) })
    }

    async fn ensure_bucket(&self) -> Result<BucketStatus, StoreError> {
        // us-east-1 is the implicit location; anything else must be spelled out
        let body = (self.region != "us-east-1").then(|| format!(
            "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
            self.region
        ));
        let resp = self.signed(Method::PUT, self.url(&self.bucket)?, body).await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        classify_create_bucket(&self.bucket, status, &text)
    }

    async fn put_file(&self, key: &str, local: &Path) -> Result<u64, StoreError> {
        let location = object_path(key)?;
        let mut file = tokio::fs::File::open(local).await.map_err(|source| StoreError::Io { path: local.to_path_buf(), source })?;
        let mut writer = BufWriter::new(Arc::clone(&self.store), location);
        let upload_err = |source| StoreError::Upload { path: local.to_path_buf(), key: key.to_string(), source };
        let bytes = tokio::io::copy(&mut file, &mut writer).await.map_err(upload_err)?;
        writer.shutdown().await.map_err(upload_err)?;
        debug!(key, bytes, "object_uploaded");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use object_store::memory::InMemory;

    fn store_cfg(credentials: Option<Credentials>) -> StoreConfig {
        StoreConfig {
            endpoint: "http://127.0.0.1:9000/".into(),
            bucket: "private-models".into(),
            prefix: "Qwen3-0.6B".into(),
            region: "us-east-1".into(),
            credentials,
            strict_bucket_create: false,
        }
    }

    #[test]
    fn uri_renders_bucket_and_prefix() {
        let uri = StorageUri::new("private-models", "Qwen3-0.6B");
        assert_eq!(uri.to_string(), "s3://private-models/Qwen3-0.6B");
        assert_eq!("s3://private-models/Qwen3-0.6B".parse::<StorageUri>().unwrap(), uri);
        assert_eq!("s3://b/nested/prefix".parse::<StorageUri>().unwrap().prefix, "nested/prefix");
    }

    #[test]
    fn uri_rejects_malformed() {
        for bad in ["http://b/p", "s3://bucket", "s3:///p", "private-models/Qwen3-0.6B", "s3://b/p q"] {
            assert!(bad.parse::<StorageUri>().is_err(), "{bad}");
        }
    }

    #[test]
    fn keys_join_prefix_and_relative_path() {
        assert_eq!(object_key("Qwen3-0.6B", Path::new("config.json")), "Qwen3-0.6B/config.json");
        assert_eq!(object_key("Qwen3-0.6B/", Path::new("onnx/model.onnx")), "Qwen3-0.6B/onnx/model.onnx");
        assert_eq!(object_key("", Path::new("a/b.json")), "a/b.json");
    }

    #[test]
    fn walks_nested_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        for f in ["config.json", "sub/tokenizer.json", "sub/deeper/model.safetensors"] {
            std::fs::write(dir.path().join(f), b"x").unwrap();
        }
        let rel: Vec<_> = artifact_files(dir.path()).unwrap().into_iter().map(|f| f.relative).collect();
        assert_eq!(rel, vec![PathBuf::from("config.json"), PathBuf::from("sub/deeper/model.safetensors"), PathBuf::from("sub/tokenizer.json")]);
    }

    #[test]
    fn bucket_conflicts_are_classified() {
        let owned = "<Error><Code>BucketAlreadyOwnedByYou</Code><Message>...</Message></Error>";
        assert_eq!(classify_create_bucket("b", StatusCode::CONFLICT, owned).unwrap(), BucketStatus::AlreadyExists);
        assert_eq!(classify_create_bucket("b", StatusCode::OK, "").unwrap(), BucketStatus::Created);

        let denied = "<Error><Code>AccessDenied</Code></Error>";
        match classify_create_bucket("b", StatusCode::FORBIDDEN, denied) {
            Err(StoreError::BucketCreation { status, code, .. }) => { assert_eq!(status, 403); assert_eq!(code, "AccessDenied"); }
            other => panic!("unexpected {other:?}"),
        }
        // a 409 with some other code is still a failure
        let busy = "<Error><Code>OperationAborted</Code></Error>";
        assert!(classify_create_bucket("b", StatusCode::CONFLICT, busy).is_err());
    }

    #[test]
    fn error_code_falls_back_to_reason() {
        assert_eq!(error_code(StatusCode::FORBIDDEN, ""), "Forbidden");
    }

    #[test]
    fn keys_are_not_reencoded() {
        for key in ["Qwen3-0.6B/tokenizer~v2.json", "Qwen3-0.6B/shard[1].safetensors", "Qwen3-0.6B/a b/c.json"] {
            assert_eq!(object_path(key).unwrap().as_ref(), key);
        }
        assert!(matches!(object_path("Qwen3-0.6B//config.json"), Err(StoreError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn upload_lands_at_computed_key() {
        let cfg = store_cfg(Some(Credentials { access_key: "minio".into(), secret_key: "minio123".into() }));
        let mut vault = S3Vault::connect(&cfg).unwrap();
        let memory: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        vault.store = Arc::clone(&memory);

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("tokenizer~v2[final].json");
        std::fs::write(&local, b"{}").unwrap();
        let key = object_key(&cfg.prefix, Path::new("tokenizer~v2[final].json"));
        assert_eq!(vault.put_file(&key, &local).await.unwrap(), 2);

        let meta = memory.head(&ObjectPath::parse(&key).unwrap()).await.unwrap();
        assert_eq!(meta.location.as_ref(), "Qwen3-0.6B/tokenizer~v2[final].json");
        assert_eq!(meta.size, 2);
    }

    #[test]
    fn connect_requires_credentials() {
        assert!(matches!(S3Vault::connect(&store_cfg(None)), Err(StoreError::MissingCredentials)));
        let vault = S3Vault::connect(&store_cfg(Some(Credentials { access_key: "minio".into(), secret_key: "minio123".into() }))).unwrap();
        assert_eq!(vault.endpoint(), "http://127.0.0.1:9000");
        assert_eq!(vault.bucket(), "private-models");
    }
}
