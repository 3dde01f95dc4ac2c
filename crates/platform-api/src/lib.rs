//! Vendor API clients for linking a Linear team with a GitHub repository.
//!
//! Both clients are thin wrappers over `reqwest` that translate vendor
//! failures into [`PlatformError`], so callers can branch on error kinds
//! (notably [`PlatformError::Conflict`]) instead of matching message text.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod github;
pub mod linear;
pub mod oauth;

pub use error::PlatformError;
pub use github::GitHubClient;
pub use linear::LinearClient;
pub use oauth::{OAuthApp, TokenResponse};

/// One side of a sync pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linear,
    #[serde(rename = "github")]
    GitHub,
}

impl Platform {
    pub const ALL: [Self; 2] = [Self::Linear, Self::GitHub];

    /// Lowercase identifier used in CSRF state prefixes and storage keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::GitHub => "github",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Linear => "Linear",
            Self::GitHub => "GitHub",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "linear" => Some(Self::Linear),
            "github" => Some(Self::GitHub),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::Platform;

    #[test]
    fn platform_identifiers_are_stable() {
        assert_eq!(Platform::Linear.as_str(), "linear");
        assert_eq!(Platform::GitHub.as_str(), "github");
        assert_eq!(Platform::parse(" GitHub "), Some(Platform::GitHub));
        assert_eq!(Platform::parse("gitlab"), None);
        assert_eq!(
            serde_json::to_string(&Platform::GitHub).expect("serialize platform"),
            "\"github\""
        );
    }
}
