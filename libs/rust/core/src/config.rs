//! Pipeline configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional file named by
//! `PROVISION_CONFIG_FILE`, then unprefixed environment variables (`MODEL_ID`,
//! `S3_BUCKET`, ...). Object store credentials have no default unless
//! `ALLOW_INSECURE_DEFAULTS=true`.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen3-0.6B";
pub const DEFAULT_ALLOW_PATTERNS: &str = "*.json,*.safetensors,*.model";
pub const DEFAULT_S3_ENDPOINT: &str = "http://minio-service.rhoai-model-registry-lab.svc.cluster.local:9000";
pub const DEFAULT_S3_BUCKET: &str = "private-models";
pub const DEFAULT_REGISTRY_HOST: &str = "model-registry-service.rhoai-model-registry.svc.cluster.local";
pub const DEFAULT_REGISTRY_PORT: u16 = 8080;
pub const DEFAULT_HANDOFF_FILE: &str = "model_uri.txt";

// lab MinIO credentials, only honored with ALLOW_INSECURE_DEFAULTS
const LAB_ACCESS_KEY: &str = "minio";
const LAB_SECRET_KEY: &str = "minio123";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config source error: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid model id '{0}' (expected 'org/name')")]
    InvalidModelId(String),
    #[error("ALLOW_PATTERNS does not contain any pattern")]
    EmptyPatterns,
    #[error("malformed MODEL_METADATA entry '{0}' (expected key=value)")]
    MalformedMetadata(String),
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    model_id: String,
    hub_revision: String,
    hf_endpoint: String,
    hf_token: Option<String>,
    hub_cache_dir: Option<PathBuf>,
    allow_patterns: String,
    s3_endpoint: String,
    s3_bucket: String,
    s3_prefix: Option<String>,
    s3_region: String,
    aws_access_key: Option<String>,
    aws_secret_key: Option<String>,
    strict_bucket_create: bool,
    registry_host: String,
    registry_port: u16,
    registry_secure: bool,
    registry_author: String,
    registered_model_name: String,
    model_version: String,
    model_format_name: String,
    model_format_version: String,
    model_description: String,
    model_metadata: Option<String>,
    handoff_file: PathBuf,
    allow_insecure_defaults: bool,
}

#[derive(Clone)]
pub struct HubConfig {
    pub model_id: String,
    pub revision: String,
    pub endpoint: String,
    pub token: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub allow_patterns: Vec<String>,
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("model_id", &self.model_id)
            .field("revision", &self.revision)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("cache_dir", &self.cache_dir)
            .field("allow_patterns", &self.allow_patterns)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("access_key", &self.access_key).field("secret_key", &"***").finish()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    /// `None` when neither the environment nor the insecure lab defaults supplied keys.
    pub credentials: Option<Credentials>,
    pub strict_bucket_create: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl RegistryConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Fields submitted with every registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSpec {
    pub model_name: String,
    pub version: String,
    pub format_name: String,
    pub format_version: String,
    pub description: String,
    pub author: String,
    pub metadata: BTreeMap<String, String>,
}

impl Default for RegistrationSpec {
    fn default() -> Self {
        Self {
            model_name: "Granite-7B-Enterprise".into(),
            version: "1.0.0".into(),
            format_name: "safetensors".into(),
            format_version: "1.0".into(),
            description: "Approved Granite 7B model for internal RAG applications.".into(),
            author: "QuickStart Admin".into(),
            metadata: default_metadata(),
        }
    }
}

fn default_metadata() -> BTreeMap<String, String> {
    [("approved_for_production", "true"), ("license", "Apache-2.0"), ("source_repo", "ibm-granite/granite-7b-lab")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub hub: HubConfig,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub registration: RegistrationSpec,
    pub handoff_file: PathBuf,
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("PROVISION_CONFIG_FILE").ok();
        Self::build(file, config::Environment::default())
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let file = vars.get("PROVISION_CONFIG_FILE").cloned();
        Self::build(file, config::Environment::default().source(Some(vars)))
    }

    fn build(file: Option<String>, env: config::Environment) -> Result<Self, ConfigError> {
        let defaults = RegistrationSpec::default();
        let mut builder = config::Config::builder()
            .set_default("model_id", DEFAULT_MODEL_ID)?
            .set_default("hub_revision", "main")?
            .set_default("hf_endpoint", "https://huggingface.co")?
            .set_default("allow_patterns", DEFAULT_ALLOW_PATTERNS)?
            .set_default("s3_endpoint", DEFAULT_S3_ENDPOINT)?
            .set_default("s3_bucket", DEFAULT_S3_BUCKET)?
            .set_default("s3_region", "us-east-1")?
            .set_default("strict_bucket_create", false)?
            .set_default("registry_host", DEFAULT_REGISTRY_HOST)?
            .set_default("registry_port", DEFAULT_REGISTRY_PORT as i64)?
            .set_default("registry_secure", false)?
            .set_default("registry_author", defaults.author.as_str())?
            .set_default("registered_model_name", defaults.model_name.as_str())?
            .set_default("model_version", defaults.version.as_str())?
            .set_default("model_format_name", defaults.format_name.as_str())?
            .set_default("model_format_version", defaults.format_version.as_str())?
            .set_default("model_description", defaults.description.as_str())?
            .set_default("handoff_file", DEFAULT_HANDOFF_FILE)?
            .set_default("allow_insecure_defaults", false)?;
        if let Some(file) = file {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        let raw: RawSettings = builder.add_source(env).build()?.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let model_name = repo_name(&raw.model_id)?.to_string();
        let allow_patterns = split_list(&raw.allow_patterns);
        if allow_patterns.is_empty() { return Err(ConfigError::EmptyPatterns); }
        let metadata = match non_empty(raw.model_metadata) {
            Some(list) => parse_metadata(&list)?,
            None => default_metadata(),
        };
        let credentials = match (non_empty(raw.aws_access_key), non_empty(raw.aws_secret_key)) {
            (Some(access_key), Some(secret_key)) => Some(Credentials { access_key, secret_key }),
            _ if raw.allow_insecure_defaults => {
                warn!("object store credentials not set, falling back to lab defaults");
                Some(Credentials { access_key: LAB_ACCESS_KEY.into(), secret_key: LAB_SECRET_KEY.into() })
            }
            _ => None,
        };
        Ok(Self {
            hub: HubConfig {
                model_id: raw.model_id,
                revision: raw.hub_revision,
                endpoint: raw.hf_endpoint,
                token: non_empty(raw.hf_token),
                cache_dir: raw.hub_cache_dir,
                allow_patterns,
            },
            store: StoreConfig {
                endpoint: raw.s3_endpoint,
                bucket: raw.s3_bucket,
                prefix: non_empty(raw.s3_prefix).unwrap_or(model_name),
                region: raw.s3_region,
                credentials,
                strict_bucket_create: raw.strict_bucket_create,
            },
            registry: RegistryConfig { host: raw.registry_host, port: raw.registry_port, secure: raw.registry_secure },
            registration: RegistrationSpec {
                model_name: raw.registered_model_name,
                version: raw.model_version,
                format_name: raw.model_format_name,
                format_version: raw.model_format_version,
                description: raw.model_description,
                author: raw.registry_author,
                metadata,
            },
            handoff_file: raw.handoff_file,
        })
    }
}

/// `org/name` -> `name`.
pub fn repo_name(model_id: &str) -> Result<&str, ConfigError> {
    match model_id.split_once('/') {
        Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => Ok(name),
        _ => Err(ConfigError::InvalidModelId(model_id.to_string())),
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

fn parse_metadata(list: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    split_list(list)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
            _ => Err(ConfigError::MalformedMetadata(pair)),
        })
        .collect()
}
