//! Webhook deployment state machine.
//!
//! ```text
//! Unchecked --check--> CheckedExists --> Deployed
//!           \--------> CheckedAbsent --deploy--> Deploying --> Deployed | Failed
//!                                      Failed --deploy--> Deploying
//! ```
//!
//! A vendor conflict while creating the hook means another actor already
//! deployed it, which is the outcome the operator asked for.

use async_trait::async_trait;
use linear_github_platform::{GitHubClient, LinearClient, Platform, PlatformError};
use linear_github_sync_client::SyncServiceClient;
use uuid::Uuid;

use crate::error::PairingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookState {
    Unchecked,
    CheckedExists,
    CheckedAbsent,
    Deploying,
    Deployed,
    Failed { message: String },
}

impl WebhookState {
    pub fn is_deployed(&self) -> bool {
        matches!(self, Self::Deployed)
    }
}

/// The team or repository a hook is registered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub resource_id: String,
    /// Repository `owner/name` for GitHub; team name for Linear.
    pub resource_name: String,
    pub label: String,
}

#[async_trait]
pub trait WebhookApi: Send + Sync {
    fn platform(&self) -> Platform;
    async fn webhook_exists(&self, target: &WebhookTarget) -> Result<bool, PairingError>;
    async fn create_webhook(
        &self,
        target: &WebhookTarget,
        secret: &str,
    ) -> Result<(), PlatformError>;
}

pub struct GitHubWebhooks {
    client: GitHubClient,
    delivery_url: String,
}

impl GitHubWebhooks {
    pub fn new(client: GitHubClient, delivery_url: impl Into<String>) -> Self {
        Self {
            client,
            delivery_url: delivery_url.into(),
        }
    }
}

#[async_trait]
impl WebhookApi for GitHubWebhooks {
    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    async fn webhook_exists(&self, target: &WebhookTarget) -> Result<bool, PairingError> {
        Ok(self
            .client
            .find_webhook(&target.resource_name, &self.delivery_url)
            .await?
            .is_some())
    }

    async fn create_webhook(
        &self,
        target: &WebhookTarget,
        secret: &str,
    ) -> Result<(), PlatformError> {
        self.client
            .create_webhook(&target.resource_name, &self.delivery_url, secret)
            .await?;
        Ok(())
    }
}

/// Linear hooks only count as deployed once the sync service also knows the
/// team, since the delivery worker resolves workflow states from that record.
pub struct LinearWebhooks {
    client: LinearClient,
    delivery_url: String,
    sync_service: SyncServiceClient,
}

impl LinearWebhooks {
    pub fn new(
        client: LinearClient,
        delivery_url: impl Into<String>,
        sync_service: SyncServiceClient,
    ) -> Self {
        Self {
            client,
            delivery_url: delivery_url.into(),
            sync_service,
        }
    }
}

#[async_trait]
impl WebhookApi for LinearWebhooks {
    fn platform(&self) -> Platform {
        Platform::Linear
    }

    async fn webhook_exists(&self, target: &WebhookTarget) -> Result<bool, PairingError> {
        let hook = self
            .client
            .find_team_webhook(&target.resource_id, &self.delivery_url)
            .await?;
        if hook.is_none() {
            return Ok(false);
        }
        Ok(self.sync_service.linear_team_exists(&target.resource_id).await?)
    }

    async fn create_webhook(
        &self,
        target: &WebhookTarget,
        secret: &str,
    ) -> Result<(), PlatformError> {
        self.client
            .create_webhook(&target.resource_id, &self.delivery_url, secret, &target.label)
            .await?;
        Ok(())
    }
}

pub struct WebhookProvisioner<A> {
    api: A,
    state: WebhookState,
    secret: Option<String>,
}

impl<A: WebhookApi> WebhookProvisioner<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            state: WebhookState::Unchecked,
            secret: None,
        }
    }

    pub fn state(&self) -> &WebhookState {
        &self.state
    }

    /// The secret of a hook this provisioner created. `None` when the hook
    /// pre-existed or another actor won the creation race.
    pub fn deployed_secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub async fn check(&mut self, target: &WebhookTarget) -> Result<&WebhookState, PairingError> {
        let exists = self.api.webhook_exists(target).await?;
        if exists {
            self.transition(WebhookState::CheckedExists, target);
            self.transition(WebhookState::Deployed, target);
        } else {
            self.transition(WebhookState::CheckedAbsent, target);
        }
        Ok(&self.state)
    }

    /// Creates the hook with a fresh secret. Only valid from `CheckedAbsent`
    /// or `Failed`; a deployed hook is left alone.
    pub async fn deploy(&mut self, target: &WebhookTarget) -> &WebhookState {
        match self.state {
            WebhookState::CheckedAbsent | WebhookState::Failed { .. } => {}
            WebhookState::Deployed => return &self.state,
            WebhookState::Unchecked | WebhookState::CheckedExists | WebhookState::Deploying => {
                tracing::warn!(
                    target: "linear_github_pairing.provisioner",
                    platform = self.api.platform().as_str(),
                    state = ?self.state,
                    "deploy requested before an existence check",
                );
                return &self.state;
            }
        }

        self.transition(WebhookState::Deploying, target);
        let secret = Uuid::new_v4().to_string();
        match self.api.create_webhook(target, &secret).await {
            Ok(()) => {
                self.secret = Some(secret);
                self.transition(WebhookState::Deployed, target);
            }
            Err(error) if error.is_conflict() => {
                tracing::info!(
                    target: "linear_github_pairing.provisioner",
                    platform = self.api.platform().as_str(),
                    resource_id = %target.resource_id,
                    "webhook already exists; treating as deployed",
                );
                self.transition(WebhookState::Deployed, target);
            }
            Err(error) => {
                self.transition(
                    WebhookState::Failed {
                        message: error.to_string(),
                    },
                    target,
                );
            }
        }
        &self.state
    }

    fn transition(&mut self, next: WebhookState, target: &WebhookTarget) {
        tracing::debug!(
            target: "linear_github_pairing.provisioner",
            platform = self.api.platform().as_str(),
            resource_id = %target.resource_id,
            from = ?self.state,
            to = ?next,
            "webhook state transition",
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    enum CreateResult {
        Created,
        Conflict,
        Rejected,
    }

    struct ScriptedApi {
        exists: bool,
        create: CreateResult,
        secrets: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn new(exists: bool, create: CreateResult) -> Self {
            Self {
                exists,
                create,
                secrets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WebhookApi for ScriptedApi {
        fn platform(&self) -> Platform {
            Platform::GitHub
        }

        async fn webhook_exists(&self, _target: &WebhookTarget) -> Result<bool, PairingError> {
            Ok(self.exists)
        }

        async fn create_webhook(
            &self,
            _target: &WebhookTarget,
            secret: &str,
        ) -> Result<(), PlatformError> {
            if let Ok(mut secrets) = self.secrets.lock() {
                secrets.push(secret.to_string());
            }
            match self.create {
                CreateResult::Created => Ok(()),
                CreateResult::Conflict => Err(PlatformError::Conflict {
                    platform: Platform::GitHub,
                    message: "Hook already exists on this repository".to_string(),
                }),
                CreateResult::Rejected => Err(PlatformError::Rejected {
                    platform: Platform::GitHub,
                    status: 403,
                    message: "Resource not accessible by integration".to_string(),
                }),
            }
        }
    }

    fn target() -> WebhookTarget {
        WebhookTarget {
            resource_id: "42".to_string(),
            resource_name: "octo/sync".to_string(),
            label: "sync".to_string(),
        }
    }

    #[tokio::test]
    async fn existing_hook_is_deployed_without_creation() -> Result<(), PairingError> {
        let api = ScriptedApi::new(true, CreateResult::Rejected);
        let mut provisioner = WebhookProvisioner::new(api);
        assert_eq!(provisioner.check(&target()).await?, &WebhookState::Deployed);
        assert_eq!(provisioner.deploy(&target()).await, &WebhookState::Deployed);
        assert_eq!(provisioner.deployed_secret(), None);
        Ok(())
    }

    #[tokio::test]
    async fn conflict_ends_in_the_same_state_as_creation() -> Result<(), PairingError> {
        let mut created = WebhookProvisioner::new(ScriptedApi::new(false, CreateResult::Created));
        let mut raced = WebhookProvisioner::new(ScriptedApi::new(false, CreateResult::Conflict));
        assert_eq!(created.check(&target()).await?, &WebhookState::CheckedAbsent);
        raced.check(&target()).await?;

        let created_state = created.deploy(&target()).await.clone();
        let raced_state = raced.deploy(&target()).await.clone();
        assert_eq!(created_state, WebhookState::Deployed);
        assert_eq!(raced_state, created_state);

        let secret = created.deployed_secret().unwrap_or_default().to_string();
        assert!(Uuid::parse_str(&secret).is_ok());
        assert_eq!(raced.deployed_secret(), None);
        Ok(())
    }

    #[tokio::test]
    async fn failure_is_retried_with_a_fresh_secret() -> Result<(), PairingError> {
        let api = ScriptedApi::new(false, CreateResult::Rejected);
        let mut provisioner = WebhookProvisioner::new(api);
        provisioner.check(&target()).await?;

        let state = provisioner.deploy(&target()).await.clone();
        assert!(matches!(
            &state,
            WebhookState::Failed { message } if message.contains("Resource not accessible")
        ));
        provisioner.deploy(&target()).await;

        let secrets = provisioner.api.secrets.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(secrets.len(), 2);
        assert_ne!(secrets[0], secrets[1]);
        Ok(())
    }

    #[tokio::test]
    async fn deploy_requires_a_check_first() {
        let api = ScriptedApi::new(false, CreateResult::Created);
        let mut provisioner = WebhookProvisioner::new(api);
        assert_eq!(provisioner.deploy(&target()).await, &WebhookState::Unchecked);
        assert!(provisioner.api.secrets.lock().map(|s| s.is_empty()).unwrap_or(false));
    }
}
