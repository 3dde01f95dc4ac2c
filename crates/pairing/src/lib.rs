//! Operator-side pairing of a Linear team with a GitHub repository.
//!
//! A [`PairingSession`] walks both platforms through OAuth, resource
//! selection, webhook deployment and label provisioning, then saves the
//! pairing with the sync service.

pub mod config;
pub mod context;
pub mod error;
pub mod labels;
pub mod oauth;
pub mod provisioner;
pub mod session;
pub mod storage;

pub use config::PairingConfig;
pub use context::{ContextAction, ContextStore, PlatformContext, SessionState};
pub use error::PairingError;
pub use labels::{LabelCoordinator, WorkflowStateChoice};
pub use oauth::{CallbackOutcome, CallbackParams, OAuthError, OAuthFlow};
pub use provisioner::{WebhookProvisioner, WebhookState, WebhookTarget};
pub use session::{Finalized, PairingSession};
pub use storage::{FileSessionStorage, MemorySessionStorage, SessionStorage};
