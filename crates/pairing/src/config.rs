use std::env;
use std::path::PathBuf;
use std::time::Duration;

use linear_github_platform::github::{DEFAULT_GITHUB_API_BASE_URL, DEFAULT_USER_AGENT};
use linear_github_platform::linear::DEFAULT_LINEAR_API_URL;
use linear_github_platform::oauth::{
    GITHUB_AUTHORIZE_URL, GITHUB_TOKEN_URL, LINEAR_AUTHORIZE_URL, LINEAR_TOKEN_URL,
};
use linear_github_platform::{OAuthApp, Platform};
use linear_github_sync_client::DEFAULT_SERVICE_URL;
use thiserror::Error;

use crate::labels::DEFAULT_LABEL_COLOR;

const DEFAULT_RESET_DELAY_MS: u64 = 5_000;
const DEFAULT_SESSION_FILE: &str = ".linear-github-pair/session.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub service_url: String,
    pub linear_oauth: Option<OAuthCredentials>,
    pub github_oauth: Option<OAuthCredentials>,
    pub linear_authorize_url: String,
    pub linear_token_url: String,
    pub github_authorize_url: String,
    pub github_token_url: String,
    pub linear_api_url: String,
    pub github_api_base_url: String,
    pub user_agent: String,
    /// Public URL the Linear webhook delivers to.
    pub linear_webhook_url: Option<String>,
    pub github_webhook_url: Option<String>,
    pub session_path: PathBuf,
    pub label_color: String,
    /// Pause between a successful save and the context reset.
    pub reset_delay: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LGS_RESET_DELAY_MS value '{value}': {source}")]
    InvalidResetDelay {
        value: String,
        source: std::num::ParseIntError,
    },
}

impl PairingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let reset_delay = match optional_env("LGS_RESET_DELAY_MS") {
            Some(value) => {
                let millis = value
                    .parse::<u64>()
                    .map_err(|source| ConfigError::InvalidResetDelay { value, source })?;
                Duration::from_millis(millis)
            }
            None => Duration::from_millis(DEFAULT_RESET_DELAY_MS),
        };

        Ok(Self {
            service_url: optional_env("LGS_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
            linear_oauth: oauth_credentials("LINEAR"),
            github_oauth: oauth_credentials("GITHUB"),
            linear_authorize_url: optional_env("LGS_LINEAR_AUTHORIZE_URL")
                .unwrap_or_else(|| LINEAR_AUTHORIZE_URL.to_string()),
            linear_token_url: optional_env("LGS_LINEAR_TOKEN_URL")
                .unwrap_or_else(|| LINEAR_TOKEN_URL.to_string()),
            github_authorize_url: optional_env("LGS_GITHUB_AUTHORIZE_URL")
                .unwrap_or_else(|| GITHUB_AUTHORIZE_URL.to_string()),
            github_token_url: optional_env("LGS_GITHUB_TOKEN_URL")
                .unwrap_or_else(|| GITHUB_TOKEN_URL.to_string()),
            linear_api_url: optional_env("LGS_LINEAR_API_URL")
                .unwrap_or_else(|| DEFAULT_LINEAR_API_URL.to_string()),
            github_api_base_url: optional_env("LGS_GITHUB_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE_URL.to_string()),
            user_agent: optional_env("LGS_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            linear_webhook_url: optional_env("LGS_LINEAR_WEBHOOK_URL"),
            github_webhook_url: optional_env("LGS_GITHUB_WEBHOOK_URL"),
            session_path: optional_env("LGS_SESSION_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE), PathBuf::from),
            label_color: optional_env("LGS_LABEL_COLOR")
                .unwrap_or_else(|| DEFAULT_LABEL_COLOR.to_string()),
            reset_delay,
        })
    }

    /// The registered OAuth application for `platform`, with any endpoint
    /// overrides applied.
    pub fn oauth_app(&self, platform: Platform) -> Option<OAuthApp> {
        match platform {
            Platform::Linear => self.linear_oauth.as_ref().map(|creds| {
                let mut app =
                    OAuthApp::linear(&creds.client_id, &creds.client_secret, &creds.redirect_uri);
                app.authorize_url.clone_from(&self.linear_authorize_url);
                app.token_url.clone_from(&self.linear_token_url);
                app
            }),
            Platform::GitHub => self.github_oauth.as_ref().map(|creds| {
                let mut app =
                    OAuthApp::github(&creds.client_id, &creds.client_secret, &creds.redirect_uri);
                app.authorize_url.clone_from(&self.github_authorize_url);
                app.token_url.clone_from(&self.github_token_url);
                app
            }),
        }
    }

    pub fn webhook_url(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Linear => self.linear_webhook_url.as_deref(),
            Platform::GitHub => self.github_webhook_url.as_deref(),
        }
    }
}

#[cfg(test)]
impl PairingConfig {
    /// Every remote points at `base`, so one stub server can stand in for the
    /// sync service and both vendors.
    pub fn for_tests(base: &str) -> Self {
        let credentials = OAuthCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://sync.test/callback".to_string(),
        };
        Self {
            service_url: base.to_string(),
            linear_oauth: Some(credentials.clone()),
            github_oauth: Some(credentials),
            linear_authorize_url: format!("{base}/linear/authorize"),
            linear_token_url: format!("{base}/linear/token"),
            github_authorize_url: format!("{base}/github/authorize"),
            github_token_url: format!("{base}/github/token"),
            linear_api_url: format!("{base}/graphql"),
            github_api_base_url: format!("{base}/gh"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            linear_webhook_url: Some("https://hooks.sync.test/linear".to_string()),
            github_webhook_url: Some("https://hooks.sync.test/github".to_string()),
            session_path: PathBuf::from("session.json"),
            label_color: DEFAULT_LABEL_COLOR.to_string(),
            reset_delay: Duration::from_millis(10),
        }
    }
}

fn oauth_credentials(prefix: &str) -> Option<OAuthCredentials> {
    Some(OAuthCredentials {
        client_id: optional_env(&format!("{prefix}_CLIENT_ID"))?,
        client_secret: optional_env(&format!("{prefix}_CLIENT_SECRET"))?,
        redirect_uri: optional_env(&format!("{prefix}_REDIRECT_URI"))?,
    })
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
