use thiserror::Error;

use crate::config::ConfigError;
use crate::handoff::HandoffError;
use crate::hub::HubError;
use crate::registry::RegistryError;
use crate::vault::StoreError;

/// Any failure of a pipeline stage.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("acquire failed: {0}")]
    Hub(#[from] HubError),
    #[error("publish failed: {0}")]
    Store(#[from] StoreError),
    #[error("register failed: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

impl ProvisionError {
    pub fn is_missing_handoff(&self) -> bool { matches!(self, Self::Handoff(HandoffError::Missing(_))) }
}
