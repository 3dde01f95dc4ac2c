//! Per-platform pairing context.
//!
//! The session is an immutable [`SessionState`] value. Every change goes
//! through [`reduce`] as a [`ContextAction`], and [`ContextStore::dispatch`]
//! publishes the result on a watch channel before mirroring it into
//! [`SessionStorage`]. Persistence is the only side effect and it lives in
//! `dispatch`, never in the reducer.

use std::fmt;
use std::sync::Arc;

use linear_github_platform::Platform;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::PairingError;
use crate::storage::SessionStorage;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformContext {
    #[serde(default)]
    pub user_id: Option<String>,
    /// Linear team id or GitHub repository id.
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Team name, or the repository `owner/name` used in GitHub REST paths.
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub platform_label_id: Option<String>,
}

impl fmt::Debug for PlatformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformContext")
            .field("user_id", &self.user_id)
            .field("resource_id", &self.resource_id)
            .field("resource_name", &self.resource_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("label", &self.label)
            .field("platform_label_id", &self.platform_label_id)
            .finish()
    }
}

impl PlatformContext {
    /// First field a sync save still needs, if any.
    pub fn missing(&self) -> Option<&'static str> {
        [
            ("user id", &self.user_id),
            ("resource id", &self.resource_id),
            ("api key", &self.api_key),
            ("label", &self.label),
            ("label id", &self.platform_label_id),
        ]
        .into_iter()
        .find(|(_, value)| present(value.as_deref()).is_none())
        .map(|(name, _)| name)
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_none()
    }

    pub fn api_key(&self) -> Option<&str> {
        present(self.api_key.as_deref())
    }

    pub fn resource_id(&self) -> Option<&str> {
        present(self.resource_id.as_deref())
    }

    pub fn label(&self) -> Option<&str> {
        present(self.label.as_deref())
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub linear: PlatformContext,
    pub github: PlatformContext,
}

impl SessionState {
    pub fn context(&self, platform: Platform) -> &PlatformContext {
        match platform {
            Platform::Linear => &self.linear,
            Platform::GitHub => &self.github,
        }
    }

    fn context_mut(&mut self, platform: Platform) -> &mut PlatformContext {
        match platform {
            Platform::Linear => &mut self.linear,
            Platform::GitHub => &mut self.github,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum ContextAction {
    TokenIssued { platform: Platform, api_key: String },
    IdentityResolved { platform: Platform, user_id: String },
    /// A new team or repository invalidates any label provisioned for the
    /// previous one.
    ResourceSelected {
        platform: Platform,
        resource_id: String,
        resource_name: String,
    },
    /// The label text is shared by both sides of a pairing.
    LabelChosen { label: String },
    LabelProvisioned { platform: Platform, label_id: String },
    Cleared { platform: Platform },
    /// Drops everything but identity and credentials on both sides.
    ResetPairing,
}

impl fmt::Debug for ContextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenIssued { platform, .. } => f
                .debug_struct("TokenIssued")
                .field("platform", platform)
                .finish_non_exhaustive(),
            Self::IdentityResolved { platform, user_id } => f
                .debug_struct("IdentityResolved")
                .field("platform", platform)
                .field("user_id", user_id)
                .finish(),
            Self::ResourceSelected {
                platform,
                resource_id,
                resource_name,
            } => f
                .debug_struct("ResourceSelected")
                .field("platform", platform)
                .field("resource_id", resource_id)
                .field("resource_name", resource_name)
                .finish(),
            Self::LabelChosen { label } => {
                f.debug_struct("LabelChosen").field("label", label).finish()
            }
            Self::LabelProvisioned { platform, label_id } => f
                .debug_struct("LabelProvisioned")
                .field("platform", platform)
                .field("label_id", label_id)
                .finish(),
            Self::Cleared { platform } => {
                f.debug_struct("Cleared").field("platform", platform).finish()
            }
            Self::ResetPairing => f.write_str("ResetPairing"),
        }
    }
}

pub fn reduce(state: &SessionState, action: &ContextAction) -> SessionState {
    let mut next = state.clone();
    match action {
        ContextAction::TokenIssued { platform, api_key } => {
            next.context_mut(*platform).api_key = Some(api_key.clone());
        }
        ContextAction::IdentityResolved { platform, user_id } => {
            next.context_mut(*platform).user_id = Some(user_id.clone());
        }
        ContextAction::ResourceSelected {
            platform,
            resource_id,
            resource_name,
        } => {
            let context = next.context_mut(*platform);
            context.resource_id = Some(resource_id.clone());
            context.resource_name = Some(resource_name.clone());
            context.platform_label_id = None;
        }
        ContextAction::LabelChosen { label } => {
            for platform in Platform::ALL {
                let context = next.context_mut(platform);
                if context.label.as_deref() != Some(label.as_str()) {
                    context.label = Some(label.clone());
                    context.platform_label_id = None;
                }
            }
        }
        ContextAction::LabelProvisioned { platform, label_id } => {
            next.context_mut(*platform).platform_label_id = Some(label_id.clone());
        }
        ContextAction::Cleared { platform } => {
            *next.context_mut(*platform) = PlatformContext::default();
        }
        ContextAction::ResetPairing => {
            for platform in Platform::ALL {
                let context = next.context_mut(platform);
                *context = PlatformContext {
                    user_id: context.user_id.take(),
                    api_key: context.api_key.take(),
                    ..PlatformContext::default()
                };
            }
        }
    }
    next
}

pub fn context_storage_key(platform: Platform) -> &'static str {
    match platform {
        Platform::Linear => "linearContext",
        Platform::GitHub => "githubContext",
    }
}

pub fn verification_storage_key(platform: Platform) -> String {
    format!("{}-verification", platform.as_str())
}

/// Shared handle to the session state. Clones observe the same state.
#[derive(Clone)]
pub struct ContextStore {
    sender: Arc<watch::Sender<SessionState>>,
    storage: Arc<dyn SessionStorage>,
}

impl ContextStore {
    /// Rebuilds the session from storage. Unreadable entries start empty.
    pub async fn restore(storage: Arc<dyn SessionStorage>) -> Result<Self, PairingError> {
        let mut state = SessionState::default();
        for platform in Platform::ALL {
            let key = context_storage_key(platform);
            let Some(raw) = storage.get(key).await? else {
                continue;
            };
            match serde_json::from_str::<PlatformContext>(&raw) {
                Ok(context) => *state.context_mut(platform) = context,
                Err(error) => {
                    tracing::warn!(
                        target: "linear_github_pairing.context",
                        key,
                        error = %error,
                        "discarding unreadable stored context",
                    );
                }
            }
        }
        let (sender, _) = watch::channel(state);
        Ok(Self {
            sender: Arc::new(sender),
            storage,
        })
    }

    pub fn snapshot(&self) -> SessionState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.sender.subscribe()
    }

    pub fn storage(&self) -> &Arc<dyn SessionStorage> {
        &self.storage
    }

    /// Applies `action` and persists every context it changed. A context is
    /// only kept in storage while it carries an API key.
    pub async fn dispatch(&self, action: ContextAction) -> Result<SessionState, PairingError> {
        let mut previous = None;
        self.sender.send_if_modified(|state| {
            let next = reduce(state, &action);
            if next == *state {
                return false;
            }
            previous = Some(std::mem::replace(state, next));
            true
        });

        let current = self.snapshot();
        let Some(previous) = previous else {
            return Ok(current);
        };
        tracing::debug!(target: "linear_github_pairing.context", ?action, "context updated");

        for platform in Platform::ALL {
            let context = current.context(platform);
            if previous.context(platform) == context {
                continue;
            }
            let key = context_storage_key(platform);
            if context.api_key().is_some() {
                let payload = serde_json::to_string(context).map_err(PairingError::storage)?;
                self.storage.set(key, payload).await?;
            } else {
                self.storage.remove(key).await?;
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionStorage;

    fn complete_context(resource: &str) -> PlatformContext {
        PlatformContext {
            user_id: Some("user-1".to_string()),
            resource_id: Some(resource.to_string()),
            resource_name: Some("octo/sync".to_string()),
            api_key: Some("key".to_string()),
            label: Some("sync".to_string()),
            platform_label_id: Some("label-1".to_string()),
        }
    }

    #[test]
    fn reducer_keeps_identity_on_reset() {
        let state = SessionState {
            linear: complete_context("team-1"),
            github: complete_context("42"),
        };
        let next = reduce(&state, &ContextAction::ResetPairing);
        for platform in Platform::ALL {
            let context = next.context(platform);
            assert_eq!(context.user_id.as_deref(), Some("user-1"));
            assert_eq!(context.api_key.as_deref(), Some("key"));
            assert_eq!(context.resource_id, None);
            assert_eq!(context.label, None);
            assert_eq!(context.platform_label_id, None);
        }
        assert!(state.linear.is_complete(), "reduce must not mutate its input");
    }

    #[test]
    fn reselecting_resource_or_label_invalidates_label_id() {
        let state = SessionState {
            linear: complete_context("team-1"),
            github: complete_context("42"),
        };
        let moved = reduce(
            &state,
            &ContextAction::ResourceSelected {
                platform: Platform::GitHub,
                resource_id: "43".to_string(),
                resource_name: "octo/other".to_string(),
            },
        );
        assert_eq!(moved.github.platform_label_id, None);
        assert_eq!(moved.github.missing(), Some("label id"));
        assert!(moved.linear.is_complete());

        let same_label = reduce(&state, &ContextAction::LabelChosen { label: "sync".to_string() });
        assert_eq!(same_label, state);
        let relabeled = reduce(&state, &ContextAction::LabelChosen { label: "mirror".to_string() });
        assert_eq!(relabeled.linear.label.as_deref(), Some("mirror"));
        assert_eq!(relabeled.linear.platform_label_id, None);
        assert_eq!(relabeled.github.platform_label_id, None);
    }

    #[test]
    fn debug_output_redacts_api_keys() {
        let context = complete_context("team-1");
        let rendered = format!("{context:?}");
        assert!(!rendered.contains("\"key\""));
        assert!(rendered.contains("<redacted>"));

        let action = ContextAction::TokenIssued {
            platform: Platform::Linear,
            api_key: "lin_oauth_secret".to_string(),
        };
        assert!(!format!("{action:?}").contains("lin_oauth_secret"));
    }

    #[tokio::test]
    async fn dispatch_persists_only_contexts_with_keys() -> Result<(), PairingError> {
        let storage = Arc::new(MemorySessionStorage::new());
        let store = ContextStore::restore(storage.clone()).await?;
        let mut updates = store.subscribe();

        store
            .dispatch(ContextAction::IdentityResolved {
                platform: Platform::Linear,
                user_id: "lin-user".to_string(),
            })
            .await?;
        assert_eq!(storage.get("linearContext").await?, None);
        assert!(updates.has_changed().unwrap_or(false));
        updates.borrow_and_update();

        store
            .dispatch(ContextAction::TokenIssued {
                platform: Platform::Linear,
                api_key: "lin-token".to_string(),
            })
            .await?;
        let stored = storage.get("linearContext").await?.unwrap_or_default();
        let restored: PlatformContext =
            serde_json::from_str(&stored).map_err(PairingError::storage)?;
        assert_eq!(restored.user_id.as_deref(), Some("lin-user"));
        assert_eq!(storage.get("githubContext").await?, None);

        store.dispatch(ContextAction::Cleared { platform: Platform::Linear }).await?;
        assert_eq!(storage.get("linearContext").await?, None);

        let unchanged = store
            .dispatch(ContextAction::Cleared {
                platform: Platform::Linear,
            })
            .await?;
        assert_eq!(unchanged, SessionState::default());
        Ok(())
    }

    #[tokio::test]
    async fn restore_reads_stored_contexts() -> Result<(), PairingError> {
        let storage = Arc::new(MemorySessionStorage::new());
        let context = complete_context("42");
        storage
            .set(
                "githubContext",
                serde_json::to_string(&context).map_err(PairingError::storage)?,
            )
            .await?;
        storage.set("linearContext", "not json".to_string()).await?;

        let store = ContextStore::restore(storage).await?;
        let state = store.snapshot();
        assert_eq!(state.github, context);
        assert_eq!(state.linear, PlatformContext::default());
        Ok(())
    }
}
