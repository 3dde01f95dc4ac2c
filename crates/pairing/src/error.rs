use linear_github_platform::{Platform, PlatformError};
use linear_github_sync_client::SyncServiceClientError;

use crate::oauth::OAuthError;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("sync service request failed: {0}")]
    SyncService(#[from] SyncServiceClientError),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("session storage failed: {message}")]
    Storage { message: String },
    #[error("{platform} is not configured: {message}")]
    NotConfigured { platform: Platform, message: String },
    #[error("{platform} context is incomplete: missing {missing}")]
    Incomplete {
        platform: Platform,
        missing: &'static str,
    },
    #[error("{message}")]
    LabelNotUnique { platform: Platform, message: String },
    #[error("{platform} resource {id} is not available to this account")]
    UnknownResource { platform: Platform, id: String },
    #[error("team has no \"{state}\" workflow state; choose one explicitly")]
    MissingWorkflowState { state: &'static str },
    #[error("{platform} webhook is not deployed: {message}")]
    WebhookNotDeployed { platform: Platform, message: String },
}

impl PairingError {
    pub(crate) fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage {
            message: error.to_string(),
        }
    }
}
