use linear_github_platform::linear::LinearTeam;
use linear_github_platform::{GitHubClient, LinearClient, Platform};
use linear_github_sync_client::{
    SaveGitHubRepoRequest, SaveLinearTeamRequest, SyncServiceClient, TeamMemberRef,
};

use crate::error::PairingError;

pub const DEFAULT_LABEL_COLOR: &str = "#5E6AD2";
pub const DEFAULT_TODO_STATE: &str = "Todo";
pub const DEFAULT_DONE_STATE: &str = "Done";
pub const DEFAULT_CANCELED_STATE: &str = "Canceled";

/// Operator overrides for the workflow states synced issues move through.
/// Each entry may name a state or give its id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowStateChoice {
    pub todo: Option<String>,
    pub done: Option<String>,
    pub canceled: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStates {
    pub todo: String,
    pub done: String,
    pub canceled: String,
}

impl WorkflowStateChoice {
    pub fn resolve(&self, team: &LinearTeam) -> Result<ResolvedStates, PairingError> {
        Ok(ResolvedStates {
            todo: pick_state(team, self.todo.as_deref(), DEFAULT_TODO_STATE)?,
            done: pick_state(team, self.done.as_deref(), DEFAULT_DONE_STATE)?,
            canceled: pick_state(team, self.canceled.as_deref(), DEFAULT_CANCELED_STATE)?,
        })
    }
}

fn pick_state(
    team: &LinearTeam,
    choice: Option<&str>,
    default: &'static str,
) -> Result<String, PairingError> {
    let wanted = choice.map(str::trim).filter(|value| !value.is_empty());
    let state = match wanted {
        Some(wanted) => team
            .states
            .iter()
            .find(|state| state.id == wanted || state.name.eq_ignore_ascii_case(wanted)),
        None => team.state_named(default),
    };
    state
        .map(|state| state.id.clone())
        .ok_or(PairingError::MissingWorkflowState { state: default })
}

/// Checks and provisions the shared label on both platforms and records the
/// resources the sync worker needs with the sync service.
#[derive(Debug, Clone)]
pub struct LabelCoordinator {
    sync_service: SyncServiceClient,
    color: String,
}

impl LabelCoordinator {
    pub fn new(sync_service: SyncServiceClient, color: impl Into<String>) -> Self {
        Self {
            sync_service,
            color: color.into(),
        }
    }

    /// Fails with [`PairingError::LabelNotUnique`] when a saved pairing on
    /// this team or repository already uses `label`.
    pub async fn check_unique(
        &self,
        platform: Platform,
        resource_id: &str,
        label: &str,
    ) -> Result<(), PairingError> {
        let answer = match platform {
            Platform::Linear => self.sync_service.check_linear_label(resource_id, label).await?,
            Platform::GitHub => self.sync_service.check_github_label(resource_id, label).await?,
        };
        if answer.checking_result {
            return Ok(());
        }
        Err(PairingError::LabelNotUnique {
            platform,
            message: answer.error.unwrap_or_else(|| {
                format!("label \"{label}\" is already paired on this {platform} resource")
            }),
        })
    }

    /// Creates (or reuses) the repository label and records the repository
    /// with the hook secret, if this session created the hook. Returns the
    /// label id.
    pub async fn provision_github(
        &self,
        client: &GitHubClient,
        repo_id: &str,
        repo_full_name: &str,
        label: &str,
        webhook_secret: Option<&str>,
    ) -> Result<String, PairingError> {
        let created = client.create_label(repo_full_name, label, &self.color).await?;
        self.sync_service
            .save_github_repo(&SaveGitHubRepoRequest {
                repo_id: Some(repo_id.to_string()),
                repo_name: Some(repo_full_name.to_string()),
                webhook_secret: webhook_secret.map(ToString::to_string),
            })
            .await?;
        tracing::info!(
            target: "linear_github_pairing.labels",
            repo = repo_full_name,
            label_id = created.id,
            "github label provisioned",
        );
        Ok(created.id.to_string())
    }

    /// Creates (or reuses) the team label and records the team, its members
    /// and workflow states. Returns the label id.
    pub async fn provision_linear(
        &self,
        client: &LinearClient,
        team: &LinearTeam,
        label: &str,
        states: &WorkflowStateChoice,
    ) -> Result<String, PairingError> {
        let resolved = states.resolve(team)?;
        let created = client.create_label(&team.id, label, &self.color).await?;
        let members = client.team_members(&team.id).await?;

        let summary = self
            .sync_service
            .save_linear_team(&SaveLinearTeamRequest {
                team_id: Some(team.id.clone()),
                team_name: Some(team.name.clone()),
                todo_state_id: Some(resolved.todo),
                done_state_id: Some(resolved.done),
                canceled_state_id: Some(resolved.canceled),
                members: members
                    .into_iter()
                    .map(|member| TeamMemberRef { id: Some(member.id) })
                    .collect(),
            })
            .await?;
        tracing::info!(
            target: "linear_github_pairing.labels",
            team_id = %summary.team_id,
            label_id = %created.id,
            "linear label provisioned",
        );
        Ok(created.id)
    }
}
