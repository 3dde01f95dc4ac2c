use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use linear_github_platform::github::{DEFAULT_GITHUB_API_BASE_URL, DEFAULT_USER_AGENT};
use linear_github_platform::linear::DEFAULT_LINEAR_API_URL;
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_LOG_JSON: bool = false;
const DEFAULT_SECRET_KEY_ID: &str = "v1";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub store_path: Option<PathBuf>,
    /// Base64 (url-safe or standard) encoding of a 32-byte key.
    pub secret_encryption_key: Option<String>,
    pub secret_key_id: String,
    pub linear_api_url: String,
    pub github_api_base_url: String,
    pub user_agent: String,
    pub linear_api_key_override: Option<String>,
    pub github_api_key_override: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LGS_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("LGS_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("LGS_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let log_json = env::var("LGS_LOG_JSON")
            .ok()
            .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(DEFAULT_LOG_JSON);

        let store_path = optional_env("LGS_STORE_PATH").map(PathBuf::from);
        let secret_encryption_key = optional_env("LGS_SECRET_ENCRYPTION_KEY");
        let secret_key_id =
            optional_env("LGS_SECRET_KEY_ID").unwrap_or_else(|| DEFAULT_SECRET_KEY_ID.to_string());

        let linear_api_url = optional_env("LGS_LINEAR_API_URL")
            .unwrap_or_else(|| DEFAULT_LINEAR_API_URL.to_string());
        let github_api_base_url = optional_env("LGS_GITHUB_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE_URL.to_string());
        let user_agent =
            optional_env("LGS_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(Self {
            bind_addr,
            log_filter,
            log_json,
            store_path,
            secret_encryption_key,
            secret_key_id,
            linear_api_url,
            github_api_base_url,
            user_agent,
            linear_api_key_override: optional_env("LINEAR_API_KEY"),
            github_api_key_override: optional_env("GITHUB_API_KEY"),
        })
    }
}

#[cfg(test)]
impl Config {
    /// In-memory store with a fixed encryption key and vendor URLs that
    /// nothing listens on.
    #[must_use]
    pub fn for_tests(store_path: Option<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "debug".to_string(),
            log_json: false,
            store_path,
            secret_encryption_key: Some("AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8".to_string()),
            secret_key_id: "test-v1".to_string(),
            linear_api_url: "http://127.0.0.1:9/graphql".to_string(),
            github_api_base_url: "http://127.0.0.1:9".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            linear_api_key_override: None,
            github_api_key_override: None,
        }
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
