use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod wire;

pub use wire::{
    CheckSyncRequest, ErrorBody, ExistsResponse, GitHubLabelCheckRequest, GitHubSyncSide,
    LabelCheckResponse, LinearLabelCheckRequest, LinearSyncSide, LinearTeamRequest,
    MessageResponse, RepoSummary, SaveGitHubRepoRequest, SaveLinearTeamRequest, SaveSyncRequest,
    SuccessResponse, TeamMemberRef, TeamSummary, UpsertUserRequest, UserSide,
};

pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone)]
pub struct SyncServiceClientConfig {
    pub base_url: String,
}

impl SyncServiceClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncServiceClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum SyncServiceClientError {
    #[error("sync_service_base_url_missing")]
    BaseUrlMissing,
    #[error("sync_service_invalid_path")]
    InvalidPath,
    #[error("sync_service_request_failed:{message}")]
    Request { message: String },
    #[error("sync_service_read_failed:{message}")]
    Read { message: String },
    #[error("sync_service_http_{status}:{message}")]
    Http { status: StatusCode, message: String },
    #[error("sync_service_json_decode_failed:{message}")]
    Decode { message: String },
}

impl SyncServiceClient {
    pub fn new(config: SyncServiceClientConfig) -> Result<Self, SyncServiceClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub async fn check_sync(
        &self,
        github_repo_id: &str,
        linear_team_id: &str,
    ) -> Result<bool, SyncServiceClientError> {
        let request = CheckSyncRequest {
            github_repo_id: Some(github_repo_id.to_string()),
            linear_team_id: Some(linear_team_id.to_string()),
        };
        let response: ExistsResponse = self.post_json(wire::CHECK_PATH, &request).await?;
        Ok(response.exists)
    }

    pub async fn save_sync(
        &self,
        request: &SaveSyncRequest,
    ) -> Result<MessageResponse, SyncServiceClientError> {
        self.post_json(wire::SAVE_PATH, request).await
    }

    pub async fn check_linear_label(
        &self,
        team_id: &str,
        label: &str,
    ) -> Result<LabelCheckResponse, SyncServiceClientError> {
        let request = LinearLabelCheckRequest {
            team_id: Some(team_id.to_string()),
            label: Some(label.to_string()),
        };
        self.post_label_check(wire::LINEAR_LABEL_PATH, &request).await
    }

    pub async fn check_github_label(
        &self,
        repo_id: &str,
        label: &str,
    ) -> Result<LabelCheckResponse, SyncServiceClientError> {
        let request = GitHubLabelCheckRequest {
            repo_id: Some(repo_id.to_string()),
            label: Some(label.to_string()),
        };
        self.post_label_check(wire::GITHUB_LABEL_PATH, &request).await
    }

    pub async fn save_linear_team(
        &self,
        request: &SaveLinearTeamRequest,
    ) -> Result<TeamSummary, SyncServiceClientError> {
        self.post_json(wire::LINEAR_SAVE_PATH, request).await
    }

    pub async fn linear_team_exists(&self, team_id: &str) -> Result<bool, SyncServiceClientError> {
        let request = LinearTeamRequest {
            team_id: Some(team_id.to_string()),
        };
        let response: ExistsResponse = self.post_json(wire::LINEAR_TEAM_PATH, &request).await?;
        Ok(response.exists)
    }

    pub async fn save_github_repo(
        &self,
        request: &SaveGitHubRepoRequest,
    ) -> Result<RepoSummary, SyncServiceClientError> {
        self.post_json(wire::GITHUB_SAVE_PATH, request).await
    }

    pub async fn upsert_user(
        &self,
        request: &UpsertUserRequest,
    ) -> Result<bool, SyncServiceClientError> {
        let response: SuccessResponse = self.post_json(wire::USER_PATH, request).await?;
        Ok(response.success)
    }

    pub async fn post_json<Req, Res>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<Res, SyncServiceClientError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let (status, bytes) = self.send(path, payload).await?;
        if !status.is_success() {
            return Err(format_http_error(status, &bytes));
        }
        decode(&bytes)
    }

    /// A non-unique label comes back as `404 {checkingResult: false}`, which
    /// is an answer rather than a failure.
    async fn post_label_check<Req>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<LabelCheckResponse, SyncServiceClientError>
    where
        Req: Serialize + ?Sized,
    {
        let (status, bytes) = self.send(path, payload).await?;
        if status.is_success() {
            return decode(&bytes);
        }
        match serde_json::from_slice::<LabelCheckResponse>(&bytes) {
            Ok(answer) if status == StatusCode::NOT_FOUND => Ok(answer),
            _ => Err(format_http_error(status, &bytes)),
        }
    }

    async fn send<Req>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<(StatusCode, Vec<u8>), SyncServiceClientError>
    where
        Req: Serialize + ?Sized,
    {
        let url = self.endpoint(path).ok_or(SyncServiceClientError::InvalidPath)?;
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        tracing::debug!(
            target: "linear_github_sync_client",
            %url,
            %request_id,
            "posting to sync service",
        );

        let response = self
            .http
            .post(url.as_str())
            .header("x-request-id", request_id)
            .json(payload)
            .send()
            .await
            .map_err(|error| SyncServiceClientError::Request {
                message: error.to_string(),
            })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| SyncServiceClientError::Read {
                message: error.to_string(),
            })?;
        Ok((status, bytes.to_vec()))
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> SyncServiceClientError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.text().map(ToString::to_string))
        .or_else(|| non_empty_string(String::from_utf8_lossy(body).to_string()))
        .unwrap_or_else(|| "<empty>".to_string());
    SyncServiceClientError::Http { status, message }
}

fn decode<T>(bytes: &[u8]) -> Result<T, SyncServiceClientError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    serde_json::from_slice::<T>(bytes).map_err(|error| SyncServiceClientError::Decode {
        message: error.to_string(),
    })
}

fn normalize_base_url(base_url: &str) -> Result<String, SyncServiceClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(SyncServiceClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn endpoint_builder_normalizes_paths() {
        let config = SyncServiceClientConfig::new("https://sync.example.com/");
        let client = SyncServiceClient::new(config).expect("sync client");

        assert_eq!(
            client.endpoint("/linear/label"),
            Some("https://sync.example.com/linear/label".to_string())
        );
        assert_eq!(
            client.endpoint("check"),
            Some("https://sync.example.com/check".to_string())
        );
        assert_eq!(client.endpoint(""), None);
    }

    const MISSING_IDS: &str = "Failed to check sync: missing GH repo ID or linear team id";

    #[test]
    fn http_error_mapping_reads_service_bodies() {
        let body = json!({ "error": MISSING_IDS }).to_string();
        let error = format_http_error(StatusCode::NOT_FOUND, body.as_bytes());
        assert_eq!(
            error.to_string(),
            format!("sync_service_http_404 Not Found:{MISSING_IDS}")
        );

        let empty_body = format_http_error(StatusCode::BAD_GATEWAY, b" ");
        assert_eq!(empty_body.to_string(), "sync_service_http_502 Bad Gateway:<empty>");
    }

    #[test]
    fn base_url_missing_is_rejected() {
        let result = SyncServiceClient::new(SyncServiceClientConfig::new("   "));
        assert!(matches!(result, Err(SyncServiceClientError::BaseUrlMissing)));
    }

    #[tokio::test]
    async fn label_check_treats_not_unique_as_an_answer() -> Result<()> {
        let app = Router::new()
            .route(
                "/linear/label",
                post(|Json(body): Json<Value>| async move {
                    if body["label"] == "taken" {
                        return (
                            AxumStatus::NOT_FOUND,
                            Json(json!({
                                "checkingResult": false,
                                "error": "Failed to check label with error: \
                                          label is not unique for team"
                            })),
                        );
                    }
                    (AxumStatus::OK, Json(json!({ "checkingResult": true })))
                }),
            )
            .route(
                "/check",
                post(|| async {
                    (
                        AxumStatus::NOT_FOUND,
                        Json(json!({ "error": MISSING_IDS })),
                    )
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        let client =
            SyncServiceClient::new(SyncServiceClientConfig::new(format!("http://{addr}")))?;
        let unique = client.check_linear_label("team-1", "fresh").await?;
        assert!(unique.checking_result);
        let taken = client.check_linear_label("team-1", "taken").await?;
        assert!(!taken.checking_result);
        assert!(taken.error.as_deref().is_some_and(|error| error.ends_with("not unique for team")));

        let error = client.check_sync("", "").await.expect_err("check rejected");
        assert!(matches!(
            error,
            SyncServiceClientError::Http { status, .. } if status == StatusCode::NOT_FOUND
        ));

        server.abort();
        Ok(())
    }
}
