//! End-to-end pairing of one Linear team with one GitHub repository.
//!
//! The Linear and GitHub halves are independent until [`PairingSession::finalize`]:
//! each authorizes, selects its resource and deploys its webhook and label on
//! its own. Finalization needs both contexts complete.

use std::sync::Arc;

use linear_github_platform::github::GitHubRepo;
use linear_github_platform::linear::LinearTeam;
use linear_github_platform::{GitHubClient, LinearClient, Platform};
use linear_github_sync_client::{
    GitHubSyncSide, LinearSyncSide, MessageResponse, SaveSyncRequest, SyncServiceClient,
    SyncServiceClientConfig, UpsertUserRequest, UserSide,
};
use reqwest::Url;
use tokio::task::JoinHandle;

use crate::config::PairingConfig;
use crate::context::{ContextAction, ContextStore, PlatformContext, SessionState};
use crate::error::PairingError;
use crate::labels::{LabelCoordinator, WorkflowStateChoice};
use crate::oauth::{CallbackOutcome, CallbackParams, OAuthFlow};
use crate::provisioner::{
    GitHubWebhooks, LinearWebhooks, WebhookProvisioner, WebhookState, WebhookTarget,
};
use crate::storage::{FileSessionStorage, SessionStorage};

/// A saved pairing and the pending context reset.
pub struct Finalized {
    pub message: String,
    /// Resolves once both contexts have been reset for the next pairing.
    pub reset: JoinHandle<Result<SessionState, PairingError>>,
}

pub struct PairingSession {
    config: PairingConfig,
    http: reqwest::Client,
    contexts: ContextStore,
    sync_service: SyncServiceClient,
    labels: LabelCoordinator,
}

impl PairingSession {
    /// Opens the session persisted at `config.session_path`.
    pub async fn open(config: PairingConfig) -> Result<Self, PairingError> {
        let storage = FileSessionStorage::open(&config.session_path)?;
        Self::with_storage(config, Arc::new(storage)).await
    }

    pub async fn with_storage(
        config: PairingConfig,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<Self, PairingError> {
        let contexts = ContextStore::restore(storage).await?;
        let sync_service =
            SyncServiceClient::new(SyncServiceClientConfig::new(&config.service_url))?;
        let labels = LabelCoordinator::new(sync_service.clone(), &config.label_color);
        Ok(Self {
            config,
            http: reqwest::Client::new(),
            contexts,
            sync_service,
            labels,
        })
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn state(&self) -> SessionState {
        self.contexts.snapshot()
    }

    fn oauth_flow(&self, platform: Platform) -> Result<OAuthFlow, PairingError> {
        let app = self.config.oauth_app(platform).ok_or_else(|| PairingError::NotConfigured {
            platform,
            message: "OAuth client id, secret and redirect uri are required".to_string(),
        })?;
        Ok(OAuthFlow::new(app, self.http.clone(), self.contexts.clone()))
    }

    pub async fn authorize_url(&self, platform: Platform) -> Result<Url, PairingError> {
        self.oauth_flow(platform)?.begin().await
    }

    /// Routes a vendor redirect to the platform whose state it carries. An
    /// authorized platform has its user id resolved right away.
    pub async fn handle_callback(
        &self,
        params: &CallbackParams,
    ) -> Result<Option<(Platform, CallbackOutcome)>, PairingError> {
        for platform in Platform::ALL {
            if self.config.oauth_app(platform).is_none() {
                continue;
            }
            let outcome = self.oauth_flow(platform)?.complete(params).await?;
            match outcome {
                CallbackOutcome::NotForPlatform => continue,
                CallbackOutcome::Authorized => {
                    self.resolve_identity(platform).await?;
                }
                CallbackOutcome::TokenMissing => {}
            }
            return Ok(Some((platform, outcome)));
        }
        Ok(None)
    }

    fn api_key(&self, platform: Platform) -> Result<String, PairingError> {
        self.contexts
            .snapshot()
            .context(platform)
            .api_key()
            .map(ToString::to_string)
            .ok_or(PairingError::Incomplete {
                platform,
                missing: "api key",
            })
    }

    fn linear_client(&self) -> Result<LinearClient, PairingError> {
        Ok(LinearClient::new(&self.config.linear_api_url, self.api_key(Platform::Linear)?)
            .with_http_client(self.http.clone()))
    }

    fn github_client(&self) -> Result<GitHubClient, PairingError> {
        Ok(
            GitHubClient::new(&self.config.github_api_base_url, self.api_key(Platform::GitHub)?)
                .with_user_agent(&self.config.user_agent)
                .with_http_client(self.http.clone()),
        )
    }

    pub async fn resolve_identity(&self, platform: Platform) -> Result<String, PairingError> {
        let user_id = match platform {
            Platform::Linear => self.linear_client()?.viewer().await?.id,
            Platform::GitHub => self.github_client()?.viewer().await?.id.to_string(),
        };
        self.contexts
            .dispatch(ContextAction::IdentityResolved {
                platform,
                user_id: user_id.clone(),
            })
            .await?;
        Ok(user_id)
    }

    /// Teams visible to the Linear viewer, with their workflow states.
    pub async fn list_linear_teams(&self) -> Result<Vec<LinearTeam>, PairingError> {
        let context = self.linear_client()?.viewer_context().await?;
        self.contexts
            .dispatch(ContextAction::IdentityResolved {
                platform: Platform::Linear,
                user_id: context.viewer.id,
            })
            .await?;
        Ok(context.teams)
    }

    pub async fn list_github_repos(&self) -> Result<Vec<GitHubRepo>, PairingError> {
        Ok(self.github_client()?.list_repos().await?)
    }

    pub async fn choose_label(&self, label: &str) -> Result<(), PairingError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(PairingError::Incomplete {
                platform: Platform::Linear,
                missing: "label",
            });
        }
        self.contexts
            .dispatch(ContextAction::LabelChosen {
                label: label.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn select_linear_team(&self, team_id: &str) -> Result<LinearTeam, PairingError> {
        let team = self.find_linear_team(team_id).await?;
        self.contexts
            .dispatch(ContextAction::ResourceSelected {
                platform: Platform::Linear,
                resource_id: team.id.clone(),
                resource_name: team.name.clone(),
            })
            .await?;
        Ok(team)
    }

    pub async fn select_github_repo(&self, repo: &str) -> Result<GitHubRepo, PairingError> {
        let wanted = repo.trim();
        let found = self
            .list_github_repos()
            .await?
            .into_iter()
            .find(|candidate| {
                candidate.id.to_string() == wanted
                    || candidate.full_name.eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| PairingError::UnknownResource {
                platform: Platform::GitHub,
                id: wanted.to_string(),
            })?;
        self.contexts
            .dispatch(ContextAction::ResourceSelected {
                platform: Platform::GitHub,
                resource_id: found.id.to_string(),
                resource_name: found.full_name.clone(),
            })
            .await?;
        Ok(found)
    }

    async fn find_linear_team(&self, team_id: &str) -> Result<LinearTeam, PairingError> {
        let wanted = team_id.trim();
        self.list_linear_teams()
            .await?
            .into_iter()
            .find(|team| {
                team.id == wanted
                    || team
                        .key
                        .as_deref()
                        .is_some_and(|key| key.eq_ignore_ascii_case(wanted))
            })
            .ok_or_else(|| PairingError::UnknownResource {
                platform: Platform::Linear,
                id: wanted.to_string(),
            })
    }

    /// Whether a saved pairing already links the selected team and
    /// repository. `None` until both are selected.
    pub async fn pairing_exists(&self) -> Result<Option<bool>, PairingError> {
        let state = self.contexts.snapshot();
        let (Some(repo_id), Some(team_id)) =
            (state.github.resource_id(), state.linear.resource_id())
        else {
            return Ok(None);
        };
        Ok(Some(self.sync_service.check_sync(repo_id, team_id).await?))
    }

    fn webhook_target(&self, platform: Platform) -> Result<(WebhookTarget, String), PairingError> {
        let state = self.contexts.snapshot();
        let context = state.context(platform);
        let resource_id = context.resource_id().ok_or(PairingError::Incomplete {
            platform,
            missing: "resource id",
        })?;
        let label = context.label().ok_or(PairingError::Incomplete {
            platform,
            missing: "label",
        })?;
        let delivery_url = self
            .config
            .webhook_url(platform)
            .ok_or_else(|| PairingError::NotConfigured {
                platform,
                message: "webhook delivery url is required".to_string(),
            })?
            .to_string();
        let target = WebhookTarget {
            resource_id: resource_id.to_string(),
            resource_name: context.resource_name.clone().unwrap_or_default(),
            label: label.to_string(),
        };
        Ok((target, delivery_url))
    }

    /// Deploys the team webhook, provisions the label and records the team.
    pub async fn deploy_linear(
        &self,
        states: &WorkflowStateChoice,
    ) -> Result<WebhookState, PairingError> {
        let (target, delivery_url) = self.webhook_target(Platform::Linear)?;
        self.labels
            .check_unique(Platform::Linear, &target.resource_id, &target.label)
            .await?;
        let team = self.find_linear_team(&target.resource_id).await?;
        let client = self.linear_client()?;

        let mut provisioner = WebhookProvisioner::new(LinearWebhooks::new(
            client.clone(),
            delivery_url,
            self.sync_service.clone(),
        ));
        let state = ensure_deployed(&mut provisioner, &target, Platform::Linear).await?;

        let label_id = self
            .labels
            .provision_linear(&client, &team, &target.label, states)
            .await?;
        self.contexts
            .dispatch(ContextAction::LabelProvisioned {
                platform: Platform::Linear,
                label_id,
            })
            .await?;
        Ok(state)
    }

    /// Deploys the repository webhook, provisions the label and records the
    /// repository together with the secret of a newly created hook.
    pub async fn deploy_github(&self) -> Result<WebhookState, PairingError> {
        let (target, delivery_url) = self.webhook_target(Platform::GitHub)?;
        self.labels
            .check_unique(Platform::GitHub, &target.resource_id, &target.label)
            .await?;
        let client = self.github_client()?;

        let mut provisioner =
            WebhookProvisioner::new(GitHubWebhooks::new(client.clone(), delivery_url));
        let state = ensure_deployed(&mut provisioner, &target, Platform::GitHub).await?;

        let label_id = self
            .labels
            .provision_github(
                &client,
                &target.resource_id,
                &target.resource_name,
                &target.label,
                provisioner.deployed_secret(),
            )
            .await?;
        self.contexts
            .dispatch(ContextAction::LabelProvisioned {
                platform: Platform::GitHub,
                label_id,
            })
            .await?;
        Ok(state)
    }

    /// Saves the pairing once both contexts are complete, refreshes the user
    /// mapping and schedules the context reset.
    pub async fn finalize(&self) -> Result<Finalized, PairingError> {
        let state = self.contexts.snapshot();
        for platform in Platform::ALL {
            if let Some(missing) = state.context(platform).missing() {
                return Err(PairingError::Incomplete { platform, missing });
            }
        }

        let MessageResponse { message } = self.sync_service.save_sync(&save_request(&state)).await?;
        tracing::info!(
            target: "linear_github_pairing.session",
            linear_team_id = ?state.linear.resource_id,
            github_repo_id = ?state.github.resource_id,
            "pairing saved",
        );

        if let Err(error) = self.sync_service.upsert_user(&user_request(&state)).await {
            tracing::warn!(
                target: "linear_github_pairing.session",
                error = %error,
                "failed to refresh user mapping",
            );
        }

        let contexts = self.contexts.clone();
        let delay = self.config.reset_delay;
        let reset = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            contexts.dispatch(ContextAction::ResetPairing).await
        });
        Ok(Finalized { message, reset })
    }
}

async fn ensure_deployed<A: crate::provisioner::WebhookApi>(
    provisioner: &mut WebhookProvisioner<A>,
    target: &WebhookTarget,
    platform: Platform,
) -> Result<WebhookState, PairingError> {
    if !provisioner.check(target).await?.is_deployed() {
        provisioner.deploy(target).await;
    }
    match provisioner.state() {
        WebhookState::Deployed => Ok(WebhookState::Deployed),
        WebhookState::Failed { message } => Err(PairingError::WebhookNotDeployed {
            platform,
            message: message.clone(),
        }),
        other => Err(PairingError::WebhookNotDeployed {
            platform,
            message: format!("unexpected state {other:?}"),
        }),
    }
}

fn save_request(state: &SessionState) -> SaveSyncRequest {
    let PlatformContext {
        user_id: github_user,
        resource_id: repo_id,
        api_key: github_key,
        platform_label_id: github_label_id,
        ..
    } = state.github.clone();
    let PlatformContext {
        user_id: linear_user,
        resource_id: team_id,
        api_key: linear_key,
        label,
        platform_label_id: linear_label_id,
        ..
    } = state.linear.clone();
    SaveSyncRequest {
        github: GitHubSyncSide {
            user_id: github_user,
            repo_id,
            api_key: github_key,
            github_label_id,
        },
        linear: LinearSyncSide {
            user_id: linear_user,
            team_id,
            api_key: linear_key,
            label,
            linear_label_id,
        },
    }
}

fn user_request(state: &SessionState) -> UpsertUserRequest {
    let side = |context: &PlatformContext| UserSide {
        user_id: context.user_id.clone(),
        api_key: context.api_key.clone(),
    };
    UpsertUserRequest {
        github: side(&state.github),
        linear: side(&state.linear),
    }
}
