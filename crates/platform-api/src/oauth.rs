use reqwest::Url;
use reqwest::header::ACCEPT;
use serde::Deserialize;

use crate::Platform;
use crate::error::{PlatformError, body_excerpt};

pub const LINEAR_AUTHORIZE_URL: &str = "https://linear.app/oauth/authorize";
pub const LINEAR_TOKEN_URL: &str = "https://api.linear.app/oauth/token";
pub const LINEAR_DEFAULT_SCOPES: &[&str] = &["read", "write", "admin"];
pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_DEFAULT_SCOPES: &[&str] = &["repo", "admin:repo_hook"];

/// A registered OAuth application on one platform.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub platform: Platform,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

/// Token endpoint payload. GitHub answers a bad code with `200` and an
/// `error` field, so a missing `access_token` is not an HTTP failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

impl OAuthApp {
    pub fn linear(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            platform: Platform::Linear,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            authorize_url: LINEAR_AUTHORIZE_URL.to_string(),
            token_url: LINEAR_TOKEN_URL.to_string(),
            scopes: LINEAR_DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn github(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            platform: Platform::GitHub,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            authorize_url: GITHUB_AUTHORIZE_URL.to_string(),
            token_url: GITHUB_TOKEN_URL.to_string(),
            scopes: GITHUB_DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
        }
    }

    /// Linear separates scopes with commas, GitHub with spaces.
    fn scope_param(&self) -> String {
        match self.platform {
            Platform::Linear => self.scopes.join(","),
            Platform::GitHub => self.scopes.join(" "),
        }
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, PlatformError> {
        let mut url = Url::parse(&self.authorize_url).map_err(|error| PlatformError::Decode {
            platform: self.platform,
            message: format!("authorize url is invalid: {error}"),
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scope_param())
            .append_pair("state", state);
        Ok(url)
    }

    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
    ) -> Result<TokenResponse, PlatformError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code.trim()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = http
            .post(&self.token_url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|error| PlatformError::transport(self.platform, &error))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| PlatformError::transport(self.platform, &error))?;

        if !status.is_success() {
            return Err(PlatformError::Rejected {
                platform: self.platform,
                status: status.as_u16(),
                message: body_excerpt(&bytes),
            });
        }

        let token = serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|error| PlatformError::decode(self.platform, error))?;
        if token.access_token().is_none() {
            tracing::warn!(
                target: "linear_github_platform.oauth",
                platform = self.platform.as_str(),
                error = token.error.as_deref().unwrap_or("none"),
                "token endpoint returned no access token",
            );
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::post;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn authorize_url_carries_state_and_platform_scopes() {
        let linear = OAuthApp::linear("lin_client", "secret", "https://sync.test/callback");
        let url = linear.authorize_url("linear-abc").expect("linear url");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("state".to_string(), "linear-abc".to_string())));
        assert!(pairs.contains(&("scope".to_string(), "read,write,admin".to_string())));
        assert!(url.as_str().starts_with(LINEAR_AUTHORIZE_URL));

        let github = OAuthApp::github("gh_client", "secret", "https://sync.test/callback");
        let url = github.authorize_url("github-abc").expect("github url");
        let scope = url
            .query_pairs()
            .find(|(key, _)| key == "scope")
            .map(|(_, value)| value.into_owned());
        assert_eq!(scope.as_deref(), Some("repo admin:repo_hook"));
    }

    #[tokio::test]
    async fn exchange_code_tolerates_token_less_success_payloads() -> anyhow::Result<()> {
        let app = Router::new().route(
            "/token",
            post(|| async {
                axum::Json(serde_json::json!({
                    "error": "bad_verification_code",
                    "error_description": "The code passed is incorrect or expired."
                }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        let mut github = OAuthApp::github("gh_client", "secret", "https://sync.test/callback");
        github.token_url = format!("http://{addr}/token");
        let token = github
            .exchange_code(&reqwest::Client::new(), "stale-code")
            .await?;
        assert!(token.access_token().is_none());
        assert_eq!(token.error.as_deref(), Some("bad_verification_code"));

        server.abort();
        Ok(())
    }
}
