//! Stage orchestration: acquire -> publish -> register.
//!
//! Every function drives the client traits it is handed; the services pass the
//! real clients, tests pass in-memory fakes.

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, RegistrationSpec, StoreConfig};
use crate::error::ProvisionError;
use crate::handoff::HandoffFile;
use crate::hub::{HubError, HubRequest, ModelHub};
use crate::registry::{ModelRegistry, RegisterModelRequest, Registration, RegistryError};
use crate::vault::{artifact_files, object_key, BucketStatus, ObjectVault, StorageUri, StoreError};

/// What to do when bucket creation fails for a reason other than the bucket
/// already existing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketPolicy { pub strict: bool }

impl BucketPolicy {
    pub fn from_config(cfg: &StoreConfig) -> Self { Self { strict: cfg.strict_bucket_create } }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub uri: StorageUri,
    pub objects: usize,
    pub bytes: u64,
}

pub async fn acquire(hub: &dyn ModelHub, request: &HubRequest) -> Result<PathBuf, HubError> {
    info!("=== STEP 1: ACQUIRING ASSETS ===");
    info!(repo = %request.repo_id, patterns = ?request.patterns.as_slice(), "downloading model from hub");
    let dir = hub.snapshot(request).await?;
    info!(path = %dir.display(), "model_acquired");
    Ok(dir)
}

pub async fn publish(vault: &dyn ObjectVault, local_dir: &Path, prefix: &str, policy: BucketPolicy) -> Result<PublishReport, StoreError> {
    info!("=== STEP 2: SECURING ASSETS ===");
    info!(endpoint = %vault.endpoint(), "connecting to object store");
    if let Err(e) = vault.ping().await {
        error!(endpoint = %vault.endpoint(), error = %e, "object_store_unreachable");
        error!("are you running inside the cluster? if not, port-forward the object store endpoint");
        return Err(e);
    }

    match vault.ensure_bucket().await {
        Ok(BucketStatus::Created) => info!(bucket = %vault.bucket(), "bucket_created"),
        Ok(BucketStatus::AlreadyExists) => debug!(bucket = %vault.bucket(), "bucket_exists"),
        Err(e) if policy.strict => return Err(e),
        // historical behavior: keep going and let the uploads fail if the bucket is unusable
        Err(e) => warn!(bucket = %vault.bucket(), error = %e, "bucket_create_failed_continuing"),
    }

    let uri = StorageUri::new(vault.bucket(), prefix);
    info!(%uri, "uploading artifacts");
    let mut report = PublishReport { uri, objects: 0, bytes: 0 };
    for file in artifact_files(local_dir)? {
        let key = object_key(prefix, &file.relative);
        report.bytes += vault.put_file(&key, &file.path).await?;
        report.objects += 1;
    }
    info!(objects = report.objects, bytes = report.bytes, "upload_complete");
    Ok(report)
}

pub async fn register(registry: &dyn ModelRegistry, uri: &StorageUri, spec: &RegistrationSpec) -> Result<Registration, RegistryError> {
    info!(model = %spec.model_name, version = %spec.version, %uri, "registering model version");
    let registration = registry.register_model(&RegisterModelRequest::new(uri, spec)).await?;
    info!(model_id = %registration.model_id, version_id = %registration.version_id, "model_registered");
    Ok(registration)
}

/// Register the URI recorded by a previous ingest run. The hand-off record is
/// read before `connect` is called, so a missing record never opens a
/// registry connection.
pub async fn register_from_handoff<F, R>(handoff: &HandoffFile, connect: F, spec: &RegistrationSpec) -> Result<Registration, ProvisionError>
where
    F: FnOnce() -> Result<R, RegistryError>,
    R: ModelRegistry,
{
    let uri = handoff.read()?;
    info!("=== STEP 3: GOVERNANCE & REGISTRATION ===");
    let registry = connect()?;
    Ok(register(&registry, &uri, spec).await?)
}

/// Acquire and publish, then persist the URI for the register process.
pub async fn ingest(hub: &dyn ModelHub, vault: &dyn ObjectVault, handoff: &HandoffFile, cfg: &PipelineConfig) -> Result<PublishReport, ProvisionError> {
    let request = HubRequest::from_config(&cfg.hub)?;
    let local_dir = acquire(hub, &request).await?;
    let report = publish(vault, &local_dir, &cfg.store.prefix, BucketPolicy::from_config(&cfg.store)).await?;
    handoff.write(&report.uri)?;
    info!(uri = %report.uri, handoff = %handoff.path().display(), "model_secured");
    Ok(report)
}

/// All three stages in one process; the publish result is handed to the
/// register stage directly.
pub async fn provision(
    hub: &dyn ModelHub,
    vault: &dyn ObjectVault,
    registry: &dyn ModelRegistry,
    cfg: &PipelineConfig,
) -> Result<(PublishReport, Registration), ProvisionError> {
    let request = HubRequest::from_config(&cfg.hub)?;
    let local_dir = acquire(hub, &request).await?;
    let report = publish(vault, &local_dir, &cfg.store.prefix, BucketPolicy::from_config(&cfg.store)).await?;
    info!("=== STEP 3: GOVERNANCE & REGISTRATION ===");
    let registration = register(registry, &report.uri, &cfg.registration).await?;
    Ok((report, registration))
}
