//! Model registry client (Kubeflow model registry REST API, `v1alpha3`).
//!
//! Registration follows the reference client's flow: reuse or create the
//! registered model, refuse an existing version, create the version with its
//! metadata, then attach the model artifact pointing at the storage URI.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::{RegistrationSpec, RegistryConfig};
use crate::vault::StorageUri;

pub const API_PREFIX: &str = "/api/model_registry/v1alpha3";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("version '{version}' of model '{model}' already exists")]
    VersionExists { model: String, version: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterModelRequest {
    pub name: String,
    pub uri: String,
    pub model_format_name: String,
    pub model_format_version: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
}

impl RegisterModelRequest {
    pub fn new(uri: &StorageUri, spec: &RegistrationSpec) -> Self {
        Self {
            name: spec.model_name.clone(),
            uri: uri.to_string(),
            model_format_name: spec.format_name.clone(),
            model_format_version: spec.format_version.clone(),
            version: spec.version.clone(),
            author: spec.author.clone(),
            description: spec.description.clone(),
            metadata: spec.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub model_id: String,
    pub version_id: String,
    pub artifact_id: String,
    pub name: String,
    pub version: String,
    pub uri: String,
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn register_model(&self, request: &RegisterModelRequest) -> Result<Registration, RegistryError>;
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct Entity { id: String }

#[derive(Debug, Deserialize)]
struct ErrorBody { #[serde(default)] code: String, message: String }

#[derive(Debug, Serialize)]
struct RegisteredModelCreate<'a> { name: &'a str, owner: &'a str }

#[derive(Debug, Serialize, PartialEq)]
struct MetadataValue<'a> {
    string_value: &'a str,
    #[serde(rename = "metadataType")]
    metadata_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelVersionCreate<'a> {
    name: &'a str,
    registered_model_id: &'a str,
    author: &'a str,
    description: &'a str,
    custom_properties: BTreeMap<&'a str, MetadataValue<'a>>,
}

impl<'a> ModelVersionCreate<'a> {
    fn new(request: &'a RegisterModelRequest, registered_model_id: &'a str) -> Self {
        Self {
            name: &request.version,
            registered_model_id,
            author: &request.author,
            description: &request.description,
            custom_properties: request
                .metadata
                .iter()
                .map(|(k, v)| (k.as_str(), MetadataValue { string_value: v, metadata_type: "MetadataStringValue" }))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelArtifactCreate<'a> {
    artifact_type: &'static str,
    name: &'a str,
    uri: &'a str,
    model_format_name: &'a str,
    model_format_version: &'a str,
}

impl<'a> ModelArtifactCreate<'a> {
    fn new(request: &'a RegisterModelRequest) -> Self {
        Self {
            artifact_type: "model-artifact",
            name: &request.name,
            uri: &request.uri,
            model_format_name: &request.model_format_name,
            model_format_version: &request.model_format_version,
        }
    }
}

pub struct RestRegistry {
    http: reqwest::Client,
    base: String,
}

impl RestRegistry {
    /// Build the client for `cfg`. Plain HTTP unless `secure` is set.
    pub fn connect(cfg: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base: format!("{}{}", cfg.base_url(), API_PREFIX) })
    }

    pub fn base(&self) -> &str { &self.base }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
        let status = resp.status();
        if status.is_success() { return Ok(resp); }
        let text = resp.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) if body.code.is_empty() => body.message,
            Ok(body) => format!("{}: {}", body.code, body.message),
            Err(_) => text,
        };
        Err(RegistryError::Status { status: status.as_u16(), message })
    }

    async fn find<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>, RegistryError> {
        let resp = self.http.get(format!("{}{}", self.base, path)).query(query).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND { return Ok(None); }
        Ok(Some(Self::check(resp).await?.json().await?))
    }

    async fn create<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, RegistryError> {
        let resp = self.http.post(format!("{}{}", self.base, path)).json(body).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[async_trait]
impl ModelRegistry for RestRegistry {
    #[instrument(skip(self, request), fields(model = %request.name, version = %request.version))]
    async fn register_model(&self, request: &RegisterModelRequest) -> Result<Registration, RegistryError> {
        let model = match self.find::<Entity>("/registered_model", &[("name", request.name.as_str())]).await? {
            Some(existing) => { debug!(id = %existing.id, "registered_model_reused"); existing }
            None => {
                info!(model = %request.name, "creating_model_entity");
                self.create("/registered_models", &RegisteredModelCreate { name: &request.name, owner: &request.author }).await?
            }
        };
        let existing: Option<Entity> = self
            .find("/model_version", &[("name", request.version.as_str()), ("parentResourceId", model.id.as_str())])
            .await?;
        if existing.is_some() {
            return Err(RegistryError::VersionExists { model: request.name.clone(), version: request.version.clone() });
        }
        let version: Entity = self.create("/model_versions", &ModelVersionCreate::new(request, &model.id)).await?;
        let artifact: Entity = self
            .create(&format!("/model_versions/{}/artifacts", version.id), &ModelArtifactCreate::new(request))
            .await?;
        Ok(Registration {
            model_id: model.id,
            version_id: version.id,
            artifact_id: artifact.id,
            name: request.name.clone(),
            version: request.version.clone(),
            uri: request.uri.clone(),
        })
    }
}
