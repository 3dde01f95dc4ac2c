use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use linear_github_platform::{GitHubClient, LinearClient};
use linear_github_sync_client::wire::{
    CHECK_PATH, GITHUB_LABEL_PATH, GITHUB_SAVE_PATH, LINEAR_LABEL_PATH, LINEAR_SAVE_PATH,
    LINEAR_TEAM_PATH, SAVE_PATH, USER_PATH,
};
use linear_github_sync_client::{
    CheckSyncRequest, ExistsResponse, GitHubLabelCheckRequest, LabelCheckResponse,
    LinearLabelCheckRequest, LinearTeamRequest, MessageResponse, RepoSummary,
    SaveGitHubRepoRequest, SaveLinearTeamRequest, SaveSyncRequest, SuccessResponse, TeamSummary,
    UpsertUserRequest,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod api_envelope;
pub mod config;
pub mod sync_store;

use crate::api_envelope::{
    ApiErrorCode, ApiErrorTuple, error_response, error_response_with_status, method_not_allowed,
    missing_body, missing_field, operation_failed,
};
use crate::config::Config;
use crate::sync_store::{
    RepoRecord, SaveRepoInput, SaveSyncInput, SaveTeamInput, SyncStore, SyncStoreError,
    TeamRecord, UpsertUserInput,
};

const SERVICE_NAME: &str = "linear-github-sync-service";
const HTTP_TARGET: &str = "linear_github_sync.http";

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: SyncStore,
    http: reqwest::Client,
    started_at: SystemTime,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

pub fn build_router(config: Config) -> Result<Router, SyncStoreError> {
    let store = SyncStore::from_config(&config)?;
    Ok(build_router_with_store(config, store))
}

pub fn build_router_with_store(config: Config, store: SyncStore) -> Router {
    let state = AppState {
        config: Arc::new(config),
        store,
        http: reqwest::Client::new(),
        started_at: SystemTime::now(),
    };

    Router::new()
        .route("/healthz", get(health))
        .route(CHECK_PATH, post(check_sync).fallback(reject_method))
        .route(SAVE_PATH, post(save_sync).fallback(reject_method))
        .route(LINEAR_LABEL_PATH, post(check_linear_label).fallback(reject_method))
        .route(GITHUB_LABEL_PATH, post(check_github_label).fallback(reject_method))
        .route(LINEAR_SAVE_PATH, post(save_linear_team).fallback(reject_method))
        .route(LINEAR_TEAM_PATH, post(linear_team_exists).fallback(reject_method))
        .route(GITHUB_SAVE_PATH, post(save_github_repo).fallback(reject_method))
        .route(USER_PATH, post(upsert_user).fallback(reject_method))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
    })
}

async fn reject_method() -> ApiErrorTuple {
    method_not_allowed()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiErrorTuple> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(missing_body());
    }
    serde_json::from_slice::<T>(body).map_err(|error| {
        error_response(
            ApiErrorCode::InvalidBody,
            format!("Failed to parse request body: {error}"),
        )
    })
}

fn required(value: Option<String>, message: &str) -> Result<String, ApiErrorTuple> {
    value.ok_or_else(|| missing_field(message))
}

async fn check_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExistsResponse>, ApiErrorTuple> {
    let request: CheckSyncRequest = parse_body(&body)?;
    let (Some(github_repo_id), Some(linear_team_id)) =
        (request.github_repo_id, request.linear_team_id)
    else {
        return Err(missing_field(
            "Failed to check sync: missing GH repo ID or linear team id",
        ));
    };

    let exists = state
        .store
        .sync_exists(&github_repo_id, &linear_team_id)
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "check sync", error))?;
    Ok(Json(ExistsResponse { exists }))
}

async fn save_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<MessageResponse>, ApiErrorTuple> {
    let SaveSyncRequest { github, linear } = parse_body(&body)?;

    let github_user_id = required(github.user_id, "Failed to save sync: missing GH user ID")?;
    let github_repo_id = required(github.repo_id, "Failed to save sync: missing GH repo ID")?;
    let linear_user_id = required(linear.user_id, "Failed to save sync: missing Linear user ID")?;
    let linear_team_id = required(linear.team_id, "Failed to save sync: missing Linear team ID")?;
    let (Some(github_api_key), Some(linear_api_key)) = (github.api_key, linear.api_key) else {
        return Err(missing_field("Failed to save sync: missing API key"));
    };
    let label = required(linear.label, "Failed to save sync: missing label")?;
    let linear_label_id = required(
        linear.linear_label_id,
        "Failed to save sync: missing linear label id",
    )?;
    let github_label_id = required(
        github.github_label_id,
        "Failed to save sync: missing github label id",
    )?;

    let record = state
        .store
        .upsert_sync(SaveSyncInput {
            github_user_id,
            github_repo_id,
            github_api_key,
            github_label_id,
            linear_user_id,
            linear_team_id,
            linear_api_key,
            label,
            linear_label_id,
        })
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "save sync", error))?;

    tracing::info!(
        target: HTTP_TARGET,
        sync_id = %record.id,
        github_repo_id = %record.github_repo_id,
        linear_team_id = %record.linear_team_id,
        "sync saved",
    );
    Ok(Json(MessageResponse {
        message: "Saved successfully".to_string(),
    }))
}

fn label_check_response(unique: bool, resource: &str) -> Response {
    if unique {
        return (
            StatusCode::OK,
            Json(LabelCheckResponse {
                checking_result: true,
                error: None,
            }),
        )
            .into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(LabelCheckResponse {
            checking_result: false,
            error: Some(format!(
                "Failed to check label with error: label is not unique for {resource}"
            )),
        }),
    )
        .into_response()
}

async fn check_linear_label(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiErrorTuple> {
    let request: LinearLabelCheckRequest = parse_body(&body)?;
    let team_id = required(request.team_id, "Failed to check label: missing Linear team ID")?;
    let label = required(request.label, "Failed to check label: missing label")?;

    let unique = state
        .store
        .label_is_unique_for_team(&team_id, &label)
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "check label", error))?;
    Ok(label_check_response(unique, "team"))
}

async fn check_github_label(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiErrorTuple> {
    let request: GitHubLabelCheckRequest = parse_body(&body)?;
    let repo_id = required(request.repo_id, "Failed to check label: missing GH repo ID")?;
    let label = required(request.label, "Failed to check label: missing label")?;

    let unique = state
        .store
        .label_is_unique_for_repo(&repo_id, &label)
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "check label", error))?;
    Ok(label_check_response(unique, "repo"))
}

fn team_failure(message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(StatusCode::BAD_REQUEST, ApiErrorCode::MissingField, message)
}

fn team_summary(record: TeamRecord) -> TeamSummary {
    TeamSummary {
        team_id: record.team_id,
        team_name: record.team_name,
        todo_state_id: record.todo_state_id,
        done_state_id: record.done_state_id,
        canceled_state_id: record.canceled_state_id,
    }
}

/// Team failures answer 400 rather than the 404 used elsewhere.
async fn save_linear_team(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TeamSummary>, ApiErrorTuple> {
    let request: SaveLinearTeamRequest = parse_body(&body)?;
    let team_id = request
        .team_id
        .ok_or_else(|| team_failure("Failed to save team: missing team ID"))?;
    let team_name = request
        .team_name
        .ok_or_else(|| team_failure("Failed to save team: missing team name"))?;
    let (Some(todo_state_id), Some(done_state_id), Some(canceled_state_id)) = (
        request.todo_state_id,
        request.done_state_id,
        request.canceled_state_id,
    ) else {
        return Err(team_failure("Failed to save team: missing label or state"));
    };
    let member_ids: Vec<String> = request
        .members
        .into_iter()
        .filter_map(|member| member.id)
        .collect();
    if member_ids.is_empty() {
        return Err(team_failure("Failed to save team: missing team members"));
    }

    let member_count = member_ids.len();
    let record = state
        .store
        .upsert_team(SaveTeamInput {
            team_id,
            team_name,
            todo_state_id,
            done_state_id,
            canceled_state_id,
            member_ids,
        })
        .await
        .map_err(|error| {
            error_response_with_status(
                StatusCode::BAD_REQUEST,
                ApiErrorCode::StoreFailure,
                format!("Failed to save team with error: {error}"),
            )
        })?;

    tracing::info!(
        target: HTTP_TARGET,
        team_id = %record.team_id,
        members = member_count,
        "linear team saved",
    );
    Ok(Json(team_summary(record)))
}

async fn linear_team_exists(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExistsResponse>, ApiErrorTuple> {
    let request: LinearTeamRequest = parse_body(&body)?;
    let team_id = required(request.team_id, "Failed to check team: missing team ID")?;

    let exists = state
        .store
        .team_exists(&team_id)
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "check team", error))?;
    Ok(Json(ExistsResponse { exists }))
}

fn repo_summary(record: RepoRecord) -> RepoSummary {
    RepoSummary {
        has_webhook_secret: record.webhook_secret.is_some(),
        repo_id: record.repo_id,
        repo_name: record.repo_name,
    }
}

async fn save_github_repo(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RepoSummary>, ApiErrorTuple> {
    let request: SaveGitHubRepoRequest = parse_body(&body)?;
    let repo_id = required(request.repo_id, "Failed to save repo: missing GH repo ID")?;
    let repo_name = required(request.repo_name, "Failed to save repo: missing repo name")?;

    let record = state
        .store
        .upsert_repo(SaveRepoInput {
            repo_id,
            repo_name,
            webhook_secret: request.webhook_secret,
        })
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "save repo", error))?;

    tracing::info!(target: HTTP_TARGET, repo_id = %record.repo_id, "github repo saved");
    Ok(Json(repo_summary(record)))
}

/// Maps the GitHub user to the Linear user, refreshing names and emails from
/// both vendors. Service-level keys, when configured, replace the caller's
/// keys for the lookups only; the caller's keys are what get stored.
async fn upsert_user(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiErrorTuple> {
    let UpsertUserRequest { github, linear } = parse_body(&body)?;
    let github_user_id = required(github.user_id, "Failed to save user: missing GH user ID")?;
    let linear_user_id = required(linear.user_id, "Failed to save user: missing Linear user ID")?;
    let (Some(github_api_key), Some(linear_api_key)) = (github.api_key, linear.api_key) else {
        return Err(missing_field("Failed to save user: missing API key"));
    };

    let linear_key = state
        .config
        .linear_api_key_override
        .clone()
        .unwrap_or_else(|| linear_api_key.clone());
    let github_key = state
        .config
        .github_api_key_override
        .clone()
        .unwrap_or_else(|| github_api_key.clone());

    let linear_client = LinearClient::new(state.config.linear_api_url.clone(), linear_key)
        .with_http_client(state.http.clone());
    let github_client = GitHubClient::new(state.config.github_api_base_url.clone(), github_key)
        .with_user_agent(state.config.user_agent.clone())
        .with_http_client(state.http.clone());

    let linear_viewer = linear_client
        .viewer()
        .await
        .map_err(|error| operation_failed(ApiErrorCode::UpstreamFailure, "save user", error))?;
    let github_viewer = github_client
        .viewer()
        .await
        .map_err(|error| operation_failed(ApiErrorCode::UpstreamFailure, "save user", error))?;

    if github_viewer.id.to_string() != github_user_id {
        tracing::warn!(
            target: HTTP_TARGET,
            github_user_id = %github_user_id,
            viewer_id = github_viewer.id,
            "github viewer differs from requested user",
        );
    }

    let record = state
        .store
        .upsert_user(UpsertUserInput {
            github_user_id,
            linear_user_id,
            github_username: github_viewer.login,
            github_email: github_viewer.email,
            linear_username: linear_viewer.display_name.unwrap_or(linear_viewer.name),
            linear_email: linear_viewer.email,
            github_api_key,
            linear_api_key,
        })
        .await
        .map_err(|error| operation_failed(ApiErrorCode::StoreFailure, "save user", error))?;

    tracing::info!(
        target: HTTP_TARGET,
        user_id = %record.id,
        github_username = %record.github_username,
        linear_username = %record.linear_username,
        "user mapping saved",
    );
    Ok(Json(SuccessResponse { success: true }))
}
