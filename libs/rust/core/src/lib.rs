//! Core shared utilities for the model provisioning services.
//!
//! The three stages (acquire, publish, register) live in [`pipeline`]; the
//! concrete clients they drive sit behind the [`ModelHub`], [`ObjectVault`] and
//! [`ModelRegistry`] traits so the services and the tests share one code path.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("PROVISION_JSON_LOG").ok().map(|v| v=="1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)).try_init()?;
        } else {
            registry.with(fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

pub mod config;
pub mod error;
pub mod handoff;
pub mod hub;
pub mod pipeline;
pub mod registry;
pub mod vault;

pub use config::{ConfigError, HubConfig, PipelineConfig, RegistrationSpec, RegistryConfig, StoreConfig};
pub use error::ProvisionError;
pub use handoff::{HandoffError, HandoffFile};
pub use hub::{AllowPatterns, HfHub, HubError, HubRequest, ModelHub};
pub use pipeline::{BucketPolicy, PublishReport};
pub use registry::{ModelRegistry, RegisterModelRequest, Registration, RegistryError, RestRegistry};
pub use vault::{BucketStatus, ObjectVault, S3Vault, StorageUri, StoreError};
