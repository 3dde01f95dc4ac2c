use linear_github_platform::{OAuthApp, Platform};
use reqwest::Url;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{ContextAction, ContextStore, verification_storage_key};
use crate::error::PairingError;

#[derive(Debug, Error)]
pub enum OAuthError {
    /// The callback `state` does not match the code stored at `begin`.
    #[error("{platform} OAuth state does not match this session; discard the callback")]
    StateMismatch { platform: Platform },
    #[error("callback url is invalid: {message}")]
    InvalidCallback { message: String },
}

/// Query parameters handed back by the vendor's redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
}

impl CallbackParams {
    pub fn from_url(raw: &str) -> Result<Self, OAuthError> {
        let url = Url::parse(raw.trim()).map_err(|error| OAuthError::InvalidCallback {
            message: error.to_string(),
        })?;
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = non_empty(&value),
                "state" => params.state = non_empty(&value),
                _ => {}
            }
        }
        Ok(params)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// No code, or a state minted for the other platform.
    NotForPlatform,
    Authorized,
    /// The vendor answered without an access token; the context was cleared.
    TokenMissing,
}

/// One platform's authorization-code handshake.
#[derive(Clone)]
pub struct OAuthFlow {
    app: OAuthApp,
    http: reqwest::Client,
    contexts: ContextStore,
}

impl OAuthFlow {
    pub fn new(app: OAuthApp, http: reqwest::Client, contexts: ContextStore) -> Self {
        Self { app, http, contexts }
    }

    pub fn platform(&self) -> Platform {
        self.app.platform
    }

    /// Stores a fresh CSRF state and returns the vendor authorize URL.
    pub async fn begin(&self) -> Result<Url, PairingError> {
        let platform = self.platform();
        let state = format!("{}-{}", platform.as_str(), Uuid::new_v4());
        self.contexts
            .storage()
            .set(&verification_storage_key(platform), state.clone())
            .await?;
        Ok(self.app.authorize_url(&state)?)
    }

    pub async fn complete(&self, params: &CallbackParams) -> Result<CallbackOutcome, PairingError> {
        let platform = self.platform();
        let (Some(code), Some(state)) = (params.code.as_deref(), params.state.as_deref()) else {
            return Ok(CallbackOutcome::NotForPlatform);
        };
        if !state.starts_with(&format!("{}-", platform.as_str())) {
            return Ok(CallbackOutcome::NotForPlatform);
        }

        let storage = self.contexts.storage();
        let key = verification_storage_key(platform);
        let expected = storage.get(&key).await?;
        if expected.as_deref() != Some(state) {
            tracing::warn!(
                target: "linear_github_pairing.oauth",
                platform = platform.as_str(),
                "OAuth state mismatch; callback rejected",
            );
            return Err(OAuthError::StateMismatch { platform }.into());
        }
        storage.remove(&key).await?;

        let token = self.app.exchange_code(&self.http, code).await?;
        match token.access_token() {
            Some(api_key) => {
                self.contexts
                    .dispatch(ContextAction::TokenIssued {
                        platform,
                        api_key: api_key.to_string(),
                    })
                    .await?;
                tracing::info!(
                    target: "linear_github_pairing.oauth",
                    platform = platform.as_str(),
                    "access token issued",
                );
                Ok(CallbackOutcome::Authorized)
            }
            None => {
                self.contexts.dispatch(ContextAction::Cleared { platform }).await?;
                Ok(CallbackOutcome::TokenMissing)
            }
        }
    }
}
