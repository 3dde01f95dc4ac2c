use futures::{Stream, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Platform;
use crate::error::{PlatformError, body_excerpt};

pub const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_USER_AGENT: &str = "linear-github-sync";
pub const REPOS_PER_PAGE: u32 = 100;
pub const WEBHOOK_EVENTS: &[&str] = &["issues", "issue_comment", "label"];
const LABEL_DESCRIPTION: &str = "Created by Linear-GitHub Sync";

#[derive(Debug, Clone)]
pub struct GitHubClient {
    api_base_url: String,
    token: String,
    user_agent: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubUser {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub id: u64,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitHubWebhook {
    pub id: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub config: GitHubWebhookConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GitHubWebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitHubLabel {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GitHubErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<GitHubFieldError>,
}

#[derive(Debug, Deserialize)]
struct GitHubFieldError {
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl GitHubClient {
    pub fn new(api_base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, PlatformError> {
        let mut url = Url::parse(&self.api_base_url).map_err(|error| PlatformError::Decode {
            platform: Platform::GitHub,
            message: format!("api base url is invalid: {error}"),
        })?;
        url.path_segments_mut()
            .map_err(|()| PlatformError::Decode {
                platform: Platform::GitHub,
                message: "api base url cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn repo_url(&self, repo_full_name: &str, rest: &[&str]) -> Result<Url, PlatformError> {
        let mut segments = vec!["repos"];
        segments.extend(repo_full_name.trim().split('/').filter(|part| !part.is_empty()));
        segments.extend_from_slice(rest);
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/vnd.github+json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, Vec<u8>), PlatformError> {
        let response = request
            .send()
            .await
            .map_err(|error| PlatformError::transport(Platform::GitHub, &error))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| PlatformError::transport(Platform::GitHub, &error))?;

        if status.is_success() {
            return Ok((status, bytes.to_vec()));
        }
        Err(classify_failure(status, &bytes))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, PlatformError> {
        let (_, bytes) = self.send(request).await?;
        serde_json::from_slice::<T>(&bytes)
            .map_err(|error| PlatformError::decode(Platform::GitHub, error))
    }

    pub async fn viewer(&self) -> Result<GitHubUser, PlatformError> {
        let url = self.url(&["user"])?;
        self.send_json(self.request(Method::GET, url)).await
    }

    pub async fn list_repos_page(&self, page: u32) -> Result<Vec<GitHubRepo>, PlatformError> {
        let mut url = self.url(&["user", "repos"])?;
        url.query_pairs_mut()
            .append_pair("per_page", &REPOS_PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        self.send_json(self.request(Method::GET, url)).await
    }

    /// Pages of the viewer's repositories, fetched lazily from page 1 and
    /// ending at the first empty page. Calling this again restarts the walk.
    pub fn repo_pages(&self) -> impl Stream<Item = Result<Vec<GitHubRepo>, PlatformError>> + '_ {
        futures::stream::try_unfold(1_u32, move |page| async move {
            let repos = self.list_repos_page(page).await?;
            if repos.is_empty() {
                return Ok(None);
            }
            tracing::debug!(
                target: "linear_github_platform.github",
                page,
                count = repos.len(),
                "fetched repository page",
            );
            Ok(Some((repos, page.saturating_add(1))))
        })
    }

    pub async fn list_repos(&self) -> Result<Vec<GitHubRepo>, PlatformError> {
        let pages: Vec<Vec<GitHubRepo>> = self.repo_pages().try_collect().await?;
        Ok(pages.into_iter().flatten().collect())
    }

    pub async fn list_webhooks(
        &self,
        repo_full_name: &str,
    ) -> Result<Vec<GitHubWebhook>, PlatformError> {
        let url = self.repo_url(repo_full_name, &["hooks"])?;
        self.send_json(self.request(Method::GET, url)).await
    }

    /// The repository hook delivering to `delivery_url`, if one is registered.
    pub async fn find_webhook(
        &self,
        repo_full_name: &str,
        delivery_url: &str,
    ) -> Result<Option<GitHubWebhook>, PlatformError> {
        let target = delivery_url.trim_end_matches('/');
        Ok(self
            .list_webhooks(repo_full_name)
            .await?
            .into_iter()
            .find(|hook| {
                hook.config
                    .url
                    .as_deref()
                    .is_some_and(|url| url.trim_end_matches('/') == target)
            }))
    }

    /// Registers a repository hook. GitHub answers a duplicate hook and an
    /// unusable config (e.g. an unreachable URL) with the same `Hook` 422, so
    /// a 422 is only a conflict once a hook for `delivery_url` is found.
    pub async fn create_webhook(
        &self,
        repo_full_name: &str,
        delivery_url: &str,
        secret: &str,
    ) -> Result<GitHubWebhook, PlatformError> {
        let url = self.repo_url(repo_full_name, &["hooks"])?;
        let payload = serde_json::json!({
            "name": "web",
            "active": true,
            "events": WEBHOOK_EVENTS,
            "config": {
                "url": delivery_url,
                "content_type": "json",
                "insecure_ssl": "0",
                "secret": secret,
            },
        });

        match self
            .send_json::<GitHubWebhook>(self.request(Method::POST, url).json(&payload))
            .await
        {
            Err(PlatformError::Rejected {
                platform,
                status,
                message,
            }) if status == StatusCode::UNPROCESSABLE_ENTITY.as_u16() => {
                if self.find_webhook(repo_full_name, delivery_url).await?.is_some() {
                    tracing::info!(
                        target: "linear_github_platform.github",
                        repo = repo_full_name,
                        "webhook for delivery url already registered",
                    );
                    return Err(PlatformError::Conflict { platform, message });
                }
                Err(PlatformError::Rejected {
                    platform,
                    status,
                    message,
                })
            }
            other => other,
        }
    }

    pub async fn label(
        &self,
        repo_full_name: &str,
        name: &str,
    ) -> Result<GitHubLabel, PlatformError> {
        let url = self.repo_url(repo_full_name, &["labels", name])?;
        self.send_json(self.request(Method::GET, url)).await
    }

    /// Creates the label, or returns the existing one when GitHub reports
    /// `already_exists`.
    pub async fn create_label(
        &self,
        repo_full_name: &str,
        name: &str,
        color: &str,
    ) -> Result<GitHubLabel, PlatformError> {
        let url = self.repo_url(repo_full_name, &["labels"])?;
        let payload = serde_json::json!({
            "name": name,
            "color": color.trim_start_matches('#'),
            "description": LABEL_DESCRIPTION,
        });

        match self
            .send_json::<GitHubLabel>(self.request(Method::POST, url).json(&payload))
            .await
        {
            Ok(label) => Ok(label),
            Err(error) if error.is_conflict() => {
                tracing::info!(
                    target: "linear_github_platform.github",
                    repo = repo_full_name,
                    label = name,
                    "label already exists; reusing it",
                );
                self.label(repo_full_name, name).await
            }
            Err(error) => Err(error),
        }
    }

    pub async fn apply_labels(
        &self,
        repo_full_name: &str,
        issue_number: u64,
        labels: &[String],
    ) -> Result<(), PlatformError> {
        let number = issue_number.to_string();
        let url = self.repo_url(repo_full_name, &["issues", number.as_str(), "labels"])?;
        let payload = serde_json::json!({ "labels": labels });
        self.send(self.request(Method::POST, url).json(&payload)).await?;
        Ok(())
    }

    pub async fn create_comment(
        &self,
        repo_full_name: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<(), PlatformError> {
        let number = issue_number.to_string();
        let url = self.repo_url(repo_full_name, &["issues", number.as_str(), "comments"])?;
        let payload = serde_json::json!({ "body": body });
        self.send(self.request(Method::POST, url).json(&payload)).await?;
        Ok(())
    }
}

/// Maps a non-2xx GitHub response to a typed error. Conflicts are read from
/// the structured `errors[]` entries (`code == "already_exists"`). Hook 422s
/// stay `Rejected` here; `create_webhook` resolves them.
fn classify_failure(status: StatusCode, body: &[u8]) -> PlatformError {
    let parsed = serde_json::from_slice::<GitHubErrorBody>(body).unwrap_or_default();
    let detail = parsed
        .errors
        .iter()
        .find_map(|error| error.message.clone())
        .or(parsed.message.clone())
        .unwrap_or_else(|| body_excerpt(body));

    if status == StatusCode::UNPROCESSABLE_ENTITY
        && parsed
            .errors
            .iter()
            .any(|error| error.code.as_deref() == Some("already_exists"))
    {
        return PlatformError::Conflict {
            platform: Platform::GitHub,
            message: detail,
        };
    }

    if status == StatusCode::UNAUTHORIZED {
        return PlatformError::Unauthorized {
            platform: Platform::GitHub,
            status: status.as_u16(),
        };
    }

    PlatformError::Rejected {
        platform: Platform::GitHub,
        status: status.as_u16(),
        message: detail,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use axum::extract::{Path, Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::StreamExt;
    use serde_json::{Value, json};
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

    #[derive(Debug, Deserialize)]
    struct PageQuery {
        page: u32,
        per_page: u32,
    }

    fn repos_stub(total_pages: u32, calls: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/user/repos",
                get(
                    move |State(calls): State<Arc<AtomicUsize>>,
                          Query(query): Query<PageQuery>| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(query.per_page, REPOS_PER_PAGE);
                        if query.page == 0 || query.page > total_pages {
                            return Json(json!([]));
                        }
                        let id = u64::from(query.page);
                        Json(json!([
                            { "id": id * 10, "full_name": format!("acme/repo-{id}a") },
                            { "id": id * 10 + 1, "full_name": format!("acme/repo-{id}b") },
                        ]))
                    },
                ),
            )
            .with_state(calls)
    }

    #[tokio::test]
    async fn repo_listing_walks_pages_until_the_first_empty_one() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let (addr, server) = serve(repos_stub(3, calls.clone())).await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");

        let repos = client.list_repos().await?;
        assert_eq!(repos.len(), 6);
        assert_eq!(repos[0].full_name, "acme/repo-1a");
        assert_eq!(repos[5].id, 31);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn repo_pages_are_lazy_and_restartable() -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let (addr, server) = serve(repos_stub(5, calls.clone())).await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");

        let first: Vec<_> = client.repo_pages().take(1).collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut pages = std::pin::pin!(client.repo_pages());
        let restarted = pages.next().await.transpose()?;
        assert_eq!(
            restarted.and_then(|page| page.first().map(|repo| repo.id)),
            Some(10)
        );

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn create_label_reuses_existing_label_on_conflict() -> Result<()> {
        let app = Router::new()
            .route(
                "/repos/:owner/:repo/labels",
                post(|| async {
                    (
                        AxumStatus::UNPROCESSABLE_ENTITY,
                        Json(json!({
                            "message": "Validation Failed",
                            "errors": [{
                                "resource": "Label",
                                "code": "already_exists",
                                "field": "name"
                            }]
                        })),
                    )
                }),
            )
            .route(
                "/repos/:owner/:repo/labels/:name",
                get(|Path((owner, repo, name)): Path<(String, String, String)>| async move {
                    assert_eq!(owner, "acme");
                    assert_eq!(repo, "widgets");
                    Json(json!({ "id": 4242, "name": name, "color": "5e6ad2" }))
                }),
            );
        let (addr, server) = serve(app).await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");

        let label = client.create_label("acme/widgets", "linear sync", "#5E6AD2").await?;
        assert_eq!(label.id, 4242);
        assert_eq!(label.name, "linear sync");

        server.abort();
        Ok(())
    }

    #[tokio::test]
    async fn webhook_lookup_matches_delivery_url() -> Result<()> {
        let app = Router::new().route(
            "/repos/:owner/:repo/hooks",
            get(|| async {
                Json(json!([
                    { "id": 1, "active": true, "config": { "url": "https://other.test/hook" } },
                    {
                        "id": 2,
                        "active": true,
                        "config": { "url": "https://sync.test/api/github/webhook/" }
                    },
                ]))
            }),
        );
        let (addr, server) = serve(app).await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");

        let hook = client
            .find_webhook("acme/widgets", "https://sync.test/api/github/webhook")
            .await?;
        assert_eq!(hook.map(|hook| hook.id), Some(2));
        let missing = client
            .find_webhook("acme/widgets", "https://nowhere.test/hook")
            .await?;
        assert!(missing.is_none());

        server.abort();
        Ok(())
    }

    fn hook_rejecting_stub(registered: Value, reason: &'static str) -> Router {
        Router::new().route(
            "/repos/:owner/:repo/hooks",
            get(move || {
                let registered = registered.clone();
                async move { Json(registered) }
            })
            .post(move || async move {
                (
                    AxumStatus::UNPROCESSABLE_ENTITY,
                    Json(json!({
                        "message": "Validation Failed",
                        "errors": [{ "resource": "Hook", "code": "custom", "message": reason }],
                    })),
                )
            }),
        )
    }

    #[tokio::test]
    async fn hook_422_is_a_conflict_only_when_the_hook_is_registered() -> Result<()> {
        let delivery = "https://sync.test/api/github/webhook";

        let (addr, server) = serve(hook_rejecting_stub(
            json!([{ "id": 3, "active": true, "config": { "url": delivery } }]),
            "Hook already exists on this repository",
        ))
        .await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");
        let raced = client.create_webhook("acme/widgets", delivery, "secret").await;
        assert!(raced.is_err_and(|error| error.is_conflict()));
        server.abort();

        let (addr, server) = serve(hook_rejecting_stub(
            json!([]),
            "Config url is not supported because it isn't reachable over the public Internet",
        ))
        .await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");
        let rejected = client.create_webhook("acme/widgets", delivery, "secret").await;
        assert!(matches!(
            rejected,
            Err(PlatformError::Rejected { status: 422, ref message, .. })
                if message.contains("isn't reachable")
        ));
        server.abort();
        Ok(())
    }

    type Captured = Arc<tokio::sync::Mutex<Vec<Value>>>;

    #[tokio::test]
    async fn issue_label_and_comment_calls_post_expected_payloads() -> Result<()> {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/repos/:owner/:repo/issues/:number/labels",
                post(|State(captured): State<Captured>, Json(body): Json<Value>| async move {
                    captured.lock().await.push(body);
                    Json(json!([]))
                }),
            )
            .route(
                "/repos/:owner/:repo/issues/:number/comments",
                post(|State(captured): State<Captured>, Json(body): Json<Value>| async move {
                    captured.lock().await.push(body);
                    (AxumStatus::CREATED, Json(json!({ "id": 1 })))
                }),
            )
            .with_state(captured.clone());
        let (addr, server) = serve(app).await?;
        let client = GitHubClient::new(format!("http://{addr}"), "gho_test");

        client
            .apply_labels("acme/widgets", 7, &["linear sync".to_string()])
            .await?;
        client.create_comment("acme/widgets", 7, "Synced from Linear").await?;

        let bodies = captured.lock().await.clone();
        assert_eq!(bodies[0]["labels"][0], "linear sync");
        assert_eq!(bodies[1]["body"], "Synced from Linear");

        server.abort();
        Ok(())
    }

    #[test]
    fn failure_classification_uses_structured_fields() {
        let validation = |error: Value| {
            let body = json!({ "message": "Validation Failed", "errors": [error] });
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, body.to_string().as_bytes())
        };

        let label_exists =
            validation(json!({ "resource": "Label", "code": "already_exists", "field": "name" }));
        assert!(label_exists.is_conflict());

        let hook_custom = validation(json!({
            "resource": "Hook",
            "code": "custom",
            "message": "Hook already exists on this repository"
        }));
        assert!(matches!(hook_custom, PlatformError::Rejected { status: 422, .. }));

        let invalid_color =
            validation(json!({ "resource": "Label", "code": "invalid", "field": "color" }));
        assert!(!invalid_color.is_conflict());

        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, b"{\"message\":\"Bad credentials\"}"),
            PlatformError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, b""),
            PlatformError::Rejected { status: 404, .. }
        ));
    }
}
