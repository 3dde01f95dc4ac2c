use crate::Platform;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The vendor refused to create something because it already exists.
    #[error("{platform} reports the resource already exists: {message}")]
    Conflict { platform: Platform, message: String },
    #[error("{platform} rejected the access token ({status})")]
    Unauthorized { platform: Platform, status: u16 },
    #[error("{platform} request failed ({status}): {message}")]
    Rejected {
        platform: Platform,
        status: u16,
        message: String,
    },
    #[error("unable to contact {platform}: {message}")]
    Transport { platform: Platform, message: String },
    #[error("invalid {platform} response payload: {message}")]
    Decode { platform: Platform, message: String },
}

impl PlatformError {
    pub const fn platform(&self) -> Platform {
        match self {
            Self::Conflict { platform, .. }
            | Self::Unauthorized { platform, .. }
            | Self::Rejected { platform, .. }
            | Self::Transport { platform, .. }
            | Self::Decode { platform, .. } => *platform,
        }
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub(crate) fn transport(platform: Platform, error: &reqwest::Error) -> Self {
        Self::Transport {
            platform,
            message: error.to_string(),
        }
    }

    pub(crate) fn decode(platform: Platform, error: impl std::fmt::Display) -> Self {
        Self::Decode {
            platform,
            message: error.to_string(),
        }
    }
}

pub(crate) fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    trimmed.chars().take(512).collect()
}
