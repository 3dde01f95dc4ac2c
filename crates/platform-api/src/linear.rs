use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Platform;
use crate::error::{PlatformError, body_excerpt};

pub const DEFAULT_LINEAR_API_URL: &str = "https://api.linear.app/graphql";
pub const WEBHOOK_RESOURCE_TYPES: &[&str] = &["Issue", "Comment", "IssueLabel"];

/// GraphQL `extensions.code` values Linear uses for duplicate resources.
const CONFLICT_CODES: &[&str] = &["CONFLICT", "ALREADY_EXISTS", "DUPLICATE", "UNIQUE_CONSTRAINT"];
const AUTHENTICATION_CODE: &str = "AUTHENTICATION_ERROR";

const VIEWER_CONTEXT_QUERY: &str = r"query ViewerContext {
  viewer { id name displayName email }
  teams { nodes { id name key states { nodes { id name type } } } }
}";

const VIEWER_QUERY: &str = r"query Viewer { viewer { id name displayName email } }";

const TEAM_WEBHOOKS_QUERY: &str = r"query TeamWebhooks($teamId: String!) {
  team(id: $teamId) { webhooks { nodes { id url enabled } } }
}";

const WEBHOOK_CREATE_MUTATION: &str = r"mutation WebhookCreate($input: WebhookCreateInput!) {
  webhookCreate(input: $input) { success webhook { id url enabled } }
}";

const LABEL_CREATE_MUTATION: &str = r"mutation IssueLabelCreate($input: IssueLabelCreateInput!) {
  issueLabelCreate(input: $input) { success issueLabel { id name } }
}";

const TEAM_LABEL_QUERY: &str = r"query TeamLabel($teamId: String!, $name: String!) {
  team(id: $teamId) { labels(filter: { name: { eqIgnoreCase: $name } }) { nodes { id name } } }
}";

const TEAM_MEMBERS_QUERY: &str = r"query TeamMembers($teamId: String!) {
  team(id: $teamId) { members { nodes { id name displayName } } }
}";

#[derive(Debug, Clone)]
pub struct LinearClient {
    api_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearViewer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearWorkflowState {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "type")]
    pub state_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearTeam {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    pub states: Vec<LinearWorkflowState>,
}

impl LinearTeam {
    pub fn state_named(&self, name: &str) -> Option<&LinearWorkflowState> {
        self.states.iter().find(|state| state.name == name)
    }
}

/// The viewer and every team visible to them, with workflow states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearContext {
    pub viewer: LinearViewer,
    pub teams: Vec<LinearTeam>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinearWebhook {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LinearLabel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearMember {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    extensions: Option<GraphQlErrorExtensions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlErrorExtensions {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    user_presentable_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ViewerContextData {
    viewer: LinearViewer,
    teams: Connection<WireTeam>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: LinearViewer,
}

#[derive(Debug, Deserialize)]
struct WireTeam {
    id: String,
    name: String,
    #[serde(default)]
    key: Option<String>,
    states: Connection<LinearWorkflowState>,
}

#[derive(Debug, Deserialize)]
struct TeamData<T> {
    team: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TeamWebhooks {
    webhooks: Connection<LinearWebhook>,
}

#[derive(Debug, Deserialize)]
struct TeamLabels {
    labels: Connection<LinearLabel>,
}

#[derive(Debug, Deserialize)]
struct TeamMembers {
    members: Connection<LinearMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookCreateData {
    webhook_create: MutationPayload<LinearWebhook>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelCreateData {
    issue_label_create: LabelPayload,
}

#[derive(Debug, Deserialize)]
struct MutationPayload<T> {
    success: bool,
    webhook: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelPayload {
    success: bool,
    #[serde(default)]
    issue_label: Option<LinearLabel>,
}

impl LinearClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<T, PlatformError> {
        let response = self
            .http
            .post(&self.api_url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|error| PlatformError::transport(Platform::Linear, &error))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| PlatformError::transport(Platform::Linear, &error))?;

        // Linear reports GraphQL failures with a 400 and an `errors` array,
        // so the body is inspected before the status.
        match serde_json::from_slice::<GraphQlEnvelope<T>>(&bytes) {
            Ok(envelope) if !envelope.errors.is_empty() => {
                Err(classify_errors(status, &envelope.errors))
            }
            Ok(envelope) if status.is_success() => envelope
                .data
                .ok_or_else(|| PlatformError::decode(Platform::Linear, "response carried no data")),
            Ok(_) | Err(_) if status == StatusCode::UNAUTHORIZED => {
                Err(PlatformError::Unauthorized {
                    platform: Platform::Linear,
                    status: status.as_u16(),
                })
            }
            Ok(_) | Err(_) if !status.is_success() => Err(PlatformError::Rejected {
                platform: Platform::Linear,
                status: status.as_u16(),
                message: body_excerpt(&bytes),
            }),
            Ok(_) => Err(PlatformError::decode(Platform::Linear, "response carried no data")),
            Err(error) => Err(PlatformError::decode(Platform::Linear, error)),
        }
    }

    pub async fn viewer(&self) -> Result<LinearViewer, PlatformError> {
        let data: ViewerData = self.graphql(VIEWER_QUERY, json!({})).await?;
        Ok(data.viewer)
    }

    /// Viewer plus all teams with their workflow states, in one round trip.
    pub async fn viewer_context(&self) -> Result<LinearContext, PlatformError> {
        let data: ViewerContextData = self.graphql(VIEWER_CONTEXT_QUERY, json!({})).await?;
        let teams = data
            .teams
            .nodes
            .into_iter()
            .map(|team| LinearTeam {
                id: team.id,
                name: team.name,
                key: team.key,
                states: team.states.nodes,
            })
            .collect();
        Ok(LinearContext {
            viewer: data.viewer,
            teams,
        })
    }

    pub async fn team_webhooks(&self, team_id: &str) -> Result<Vec<LinearWebhook>, PlatformError> {
        let data: TeamData<TeamWebhooks> = self
            .graphql(TEAM_WEBHOOKS_QUERY, json!({ "teamId": team_id }))
            .await?;
        Ok(data.team.map(|team| team.webhooks.nodes).unwrap_or_default())
    }

    pub async fn find_team_webhook(
        &self,
        team_id: &str,
        delivery_url: &str,
    ) -> Result<Option<LinearWebhook>, PlatformError> {
        let target = delivery_url.trim_end_matches('/');
        Ok(self.team_webhooks(team_id).await?.into_iter().find(|hook| {
            hook.url
                .as_deref()
                .is_some_and(|url| url.trim_end_matches('/') == target)
        }))
    }

    pub async fn create_webhook(
        &self,
        team_id: &str,
        delivery_url: &str,
        secret: &str,
        label: &str,
    ) -> Result<LinearWebhook, PlatformError> {
        let input = json!({
            "url": delivery_url,
            "teamId": team_id,
            "label": label,
            "secret": secret,
            "resourceTypes": WEBHOOK_RESOURCE_TYPES,
        });
        let data: WebhookCreateData = self
            .graphql(WEBHOOK_CREATE_MUTATION, json!({ "input": input }))
            .await?;

        match data.webhook_create {
            MutationPayload {
                success: true,
                webhook: Some(webhook),
            } => Ok(webhook),
            _ => Err(PlatformError::Rejected {
                platform: Platform::Linear,
                status: StatusCode::OK.as_u16(),
                message: "webhookCreate reported success: false".to_string(),
            }),
        }
    }

    pub async fn find_label(
        &self,
        team_id: &str,
        name: &str,
    ) -> Result<Option<LinearLabel>, PlatformError> {
        let data: TeamData<TeamLabels> = self
            .graphql(TEAM_LABEL_QUERY, json!({ "teamId": team_id, "name": name }))
            .await?;
        Ok(data.team.and_then(|team| team.labels.nodes.into_iter().next()))
    }

    /// Creates the team label; a duplicate resolves to the existing label.
    pub async fn create_label(
        &self,
        team_id: &str,
        name: &str,
        color: &str,
    ) -> Result<LinearLabel, PlatformError> {
        let input = json!({ "name": name, "color": color, "teamId": team_id });
        let created = self
            .graphql::<LabelCreateData>(LABEL_CREATE_MUTATION, json!({ "input": input }))
            .await;

        let conflict = match created {
            Ok(LabelCreateData {
                issue_label_create:
                    LabelPayload {
                        success: true,
                        issue_label: Some(label),
                    },
            }) => return Ok(label),
            Ok(_) => {
                return Err(PlatformError::Rejected {
                    platform: Platform::Linear,
                    status: StatusCode::OK.as_u16(),
                    message: "issueLabelCreate reported success: false".to_string(),
                });
            }
            Err(error) if error.is_conflict() => error,
            Err(error) => return Err(error),
        };

        tracing::info!(
            target: "linear_github_platform.linear",
            team_id,
            label = name,
            "label already exists; looking it up",
        );
        self.find_label(team_id, name).await?.ok_or(conflict)
    }

    pub async fn team_members(&self, team_id: &str) -> Result<Vec<LinearMember>, PlatformError> {
        let data: TeamData<TeamMembers> = self
            .graphql(TEAM_MEMBERS_QUERY, json!({ "teamId": team_id }))
            .await?;
        Ok(data.team.map(|team| team.members.nodes).unwrap_or_default())
    }
}

fn classify_errors(status: StatusCode, errors: &[GraphQlError]) -> PlatformError {
    let message = errors
        .iter()
        .map(|error| {
            error
                .extensions
                .as_ref()
                .and_then(|extensions| extensions.user_presentable_message.clone())
                .unwrap_or_else(|| error.message.clone())
        })
        .collect::<Vec<_>>()
        .join("; ");

    let extensions = errors.iter().filter_map(|error| error.extensions.as_ref());
    let mut conflict = false;
    let mut unauthorized = status == StatusCode::UNAUTHORIZED;
    for extension in extensions {
        let code = extension.code.as_deref().map(str::to_ascii_uppercase);
        if extension.status_code == Some(409)
            || code.as_deref().is_some_and(|code| CONFLICT_CODES.contains(&code))
        {
            conflict = true;
        }
        if extension.status_code == Some(401) || code.as_deref() == Some(AUTHENTICATION_CODE) {
            unauthorized = true;
        }
    }

    if conflict {
        return PlatformError::Conflict {
            platform: Platform::Linear,
            message,
        };
    }
    if unauthorized {
        return PlatformError::Unauthorized {
            platform: Platform::Linear,
            status: StatusCode::UNAUTHORIZED.as_u16(),
        };
    }
    PlatformError::Rejected {
        platform: Platform::Linear,
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use anyhow::Result;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    async fn serve(app: Router) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Ok((addr, handle))
    }

    async fn linear_stub(Json(body): Json<Value>) -> Response {
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("ViewerContext") {
            return Json(json!({ "data": {
                "viewer": {
                    "id": "lin-user",
                    "name": "Ada",
                    "displayName": "ada",
                    "email": "ada@example.com"
                },
                "teams": { "nodes": [{
                    "id": "team-1", "name": "Core", "key": "COR",
                    "states": { "nodes": [
                        { "id": "s-todo", "name": "Todo", "type": "unstarted" },
                        { "id": "s-done", "name": "Done", "type": "completed" },
                        { "id": "s-cancel", "name": "Canceled", "type": "canceled" }
                    ]}
                }]}
            }}))
            .into_response();
        }
        if query.contains("IssueLabelCreate") {
            return (
                AxumStatus::BAD_REQUEST,
                Json(json!({ "errors": [{
                    "message": "duplicate label name",
                    "extensions": {
                        "code": "CONFLICT",
                        "userPresentableMessage": "Label already exists"
                    }
                }]})),
            )
                .into_response();
        }
        if query.contains("TeamLabel") {
            assert_eq!(body["variables"]["name"], "linear sync");
            return Json(json!({ "data": { "team": { "labels": { "nodes": [
                { "id": "label-9", "name": "linear sync" }
            ]}}}}))
            .into_response();
        }
        if query.contains("WebhookCreate") {
            let payload = json!({ "success": false, "webhook": null });
            return Json(json!({ "data": { "webhookCreate": payload } })).into_response();
        }
        if query.contains("TeamMembers") {
            return Json(json!({ "data": { "team": { "members": { "nodes": [
                { "id": "u-1", "name": "Ada" },
                { "id": "u-2", "name": "Grace", "displayName": "grace" }
            ]}}}}))
            .into_response();
        }
        (AxumStatus::UNAUTHORIZED, "unauthenticated").into_response()
    }

    async fn stub_client() -> Result<(LinearClient, JoinHandle<()>)> {
        let (addr, handle) = serve(Router::new().route("/graphql", post(linear_stub))).await?;
        Ok((LinearClient::new(format!("http://{addr}/graphql"), "lin_oauth"), handle))
    }

    #[tokio::test]
    async fn viewer_context_flattens_team_states() -> Result<()> {
        let (client, server) = stub_client().await?;

        let context = client.viewer_context().await?;
        assert_eq!(context.viewer.id, "lin-user");
        assert_eq!(context.teams.len(), 1);
        let team = &context.teams[0];
        assert_eq!(team.states.len(), 3);
        assert_eq!(team.state_named("Done").map(|state| state.id.as_str()), Some("s-done"));

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn label_conflict_resolves_to_existing_label() -> Result<()> {
        let (client, server) = stub_client().await?;

        let label = client.create_label("team-1", "linear sync", "#5e6ad2").await?;
        assert_eq!(label.id, "label-9");

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn unsuccessful_webhook_mutation_is_rejected() -> Result<()> {
        let (client, server) = stub_client().await?;

        let error = client
            .create_webhook(
                "team-1",
                "https://sync.test/api/linear/webhook",
                "secret",
                "linear sync",
            )
            .await
            .expect_err("success: false must fail");
        assert!(matches!(error, PlatformError::Rejected { .. }));
        assert!(!error.is_conflict());

        let members = client.team_members("team-1").await?;
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].display_name.as_deref(), Some("grace"));

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn bare_unauthorized_status_maps_to_unauthorized() -> Result<()> {
        let (client, server) = stub_client().await?;

        let error = client.viewer().await.expect_err("stub rejects plain viewer query");
        assert!(matches!(error, PlatformError::Unauthorized { status: 401, .. }));

        server.abort();
        Ok(())
    }

    #[test]
    fn conflict_requires_structured_code() {
        let message_only = vec![GraphQlError {
            message: "url not unique".to_string(),
            extensions: Some(GraphQlErrorExtensions {
                code: Some("INVALID_INPUT".to_string()),
                status_code: Some(400),
                user_presentable_message: None,
            }),
        }];
        assert!(!classify_errors(StatusCode::BAD_REQUEST, &message_only).is_conflict());

        let by_status = vec![GraphQlError {
            message: "url not unique".to_string(),
            extensions: Some(GraphQlErrorExtensions {
                code: None,
                status_code: Some(409),
                user_presentable_message: None,
            }),
        }];
        assert!(classify_errors(StatusCode::OK, &by_status).is_conflict());
    }
}
