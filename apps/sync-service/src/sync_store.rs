use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;

const STORE_TARGET: &str = "linear_github_sync.store";

/// Snapshot store for sync pairings and the records that hang off them.
/// Every write persists the whole state atomically when a path is set.
#[derive(Clone)]
pub struct SyncStore {
    state: Arc<RwLock<SyncStoreState>>,
    path: Option<PathBuf>,
    secret_cipher: Option<SecretCipher>,
}

#[derive(Clone)]
struct SecretCipher {
    key_id: String,
    key: [u8; 32],
}

#[derive(Debug, thiserror::Error)]
pub enum SyncStoreError {
    #[error("record not found")]
    NotFound,
    #[error("{field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("{message}")]
    Persistence { message: String },
}

/// A ChaCha20-Poly1305 ciphertext and the nonce it was sealed with, both
/// base64url encoded. The fingerprint is a SHA-256 of the plaintext so key
/// rotation can be logged without logging the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub key_id: String,
    pub value: String,
    pub iv: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub github_user_id: String,
    pub linear_user_id: String,
    pub github_repo_id: String,
    pub linear_team_id: String,
    pub github_api_key: EncryptedSecret,
    pub linear_api_key: EncryptedSecret,
    pub label: String,
    pub github_label_id: String,
    pub linear_label_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRecord {
    pub id: String,
    pub team_id: String,
    pub team_name: String,
    pub todo_state_id: String,
    pub done_state_id: String,
    pub canceled_state_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMemberRecord {
    pub team_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub github_user_id: String,
    pub linear_user_id: String,
    pub github_username: String,
    pub github_email: String,
    pub linear_username: String,
    pub linear_email: String,
    pub github_api_key: EncryptedSecret,
    pub linear_api_key: EncryptedSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRecord {
    pub repo_id: String,
    pub repo_name: String,
    #[serde(default)]
    pub webhook_secret: Option<EncryptedSecret>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SaveSyncInput {
    pub github_user_id: String,
    pub github_repo_id: String,
    pub github_api_key: String,
    pub github_label_id: String,
    pub linear_user_id: String,
    pub linear_team_id: String,
    pub linear_api_key: String,
    pub label: String,
    pub linear_label_id: String,
}

#[derive(Debug, Clone)]
pub struct SaveTeamInput {
    pub team_id: String,
    pub team_name: String,
    pub todo_state_id: String,
    pub done_state_id: String,
    pub canceled_state_id: String,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UpsertUserInput {
    pub github_user_id: String,
    pub linear_user_id: String,
    pub github_username: String,
    pub github_email: Option<String>,
    pub linear_username: String,
    pub linear_email: Option<String>,
    pub github_api_key: String,
    pub linear_api_key: String,
}

#[derive(Debug, Clone)]
pub struct SaveRepoInput {
    pub repo_id: String,
    pub repo_name: String,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncStoreState {
    #[serde(default)]
    syncs: HashMap<String, SyncRecord>,
    #[serde(default)]
    teams: HashMap<String, TeamRecord>,
    #[serde(default)]
    team_members: HashMap<String, TeamMemberRecord>,
    #[serde(default)]
    users: HashMap<String, UserRecord>,
    #[serde(default)]
    repos: HashMap<String, RepoRecord>,
}

impl SyncStore {
    /// Loads the snapshot at `config.store_path`. An existing snapshot that
    /// cannot be read or parsed is an error: booting empty would overwrite it
    /// on the next write.
    pub fn from_config(config: &Config) -> Result<Self, SyncStoreError> {
        let path = config.store_path.clone();
        let state = Self::load_state(path.as_ref())?;
        let secret_cipher = secret_cipher_from_config(config);

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path,
            secret_cipher,
        })
    }

    /// Upserts the pairing keyed by `(github user, linear user, repo, team)`.
    /// Re-saving the same tuple overwrites label, label ids and keys.
    pub async fn upsert_sync(&self, input: SaveSyncInput) -> Result<SyncRecord, SyncStoreError> {
        let github_user_id = normalize_non_empty(&input.github_user_id, "github_user_id")?;
        let linear_user_id = normalize_non_empty(&input.linear_user_id, "linear_user_id")?;
        let github_repo_id = normalize_non_empty(&input.github_repo_id, "github_repo_id")?;
        let linear_team_id = normalize_non_empty(&input.linear_team_id, "linear_team_id")?;
        let label = normalize_non_empty(&input.label, "label")?;
        let github_label_id = normalize_non_empty(&input.github_label_id, "github_label_id")?;
        let linear_label_id = normalize_non_empty(&input.linear_label_id, "linear_label_id")?;
        let github_api_key =
            self.encrypt_secret(&normalize_non_empty(&input.github_api_key, "github_api_key")?)?;
        let linear_api_key =
            self.encrypt_secret(&normalize_non_empty(&input.linear_api_key, "linear_api_key")?)?;

        let key = sync_key(&github_user_id, &linear_user_id, &github_repo_id, &linear_team_id);

        self.mutate(|state| {
            let now = Utc::now();
            let record = match state.syncs.get_mut(&key) {
                Some(existing) => {
                    if existing.github_api_key.fingerprint != github_api_key.fingerprint
                        || existing.linear_api_key.fingerprint != linear_api_key.fingerprint
                    {
                        tracing::info!(
                            target: STORE_TARGET,
                            sync_id = %existing.id,
                            "sync api keys rotated",
                        );
                    }
                    existing.label = label;
                    existing.github_label_id = github_label_id;
                    existing.linear_label_id = linear_label_id;
                    existing.github_api_key = github_api_key;
                    existing.linear_api_key = linear_api_key;
                    existing.updated_at = now;
                    existing.clone()
                }
                None => {
                    let record = SyncRecord {
                        id: format!("sync_{}", Uuid::new_v4().simple()),
                        github_user_id,
                        linear_user_id,
                        github_repo_id,
                        linear_team_id,
                        github_api_key,
                        linear_api_key,
                        label,
                        github_label_id,
                        linear_label_id,
                        created_at: now,
                        updated_at: now,
                    };
                    state.syncs.insert(key, record.clone());
                    record
                }
            };
            Ok(record)
        })
        .await
    }

    pub async fn sync_exists(
        &self,
        github_repo_id: &str,
        linear_team_id: &str,
    ) -> Result<bool, SyncStoreError> {
        let github_repo_id = normalize_non_empty(github_repo_id, "github_repo_id")?;
        let linear_team_id = normalize_non_empty(linear_team_id, "linear_team_id")?;
        let state = self.state.read().await;
        Ok(state.syncs.values().any(|sync| {
            sync.github_repo_id == github_repo_id && sync.linear_team_id == linear_team_id
        }))
    }

    pub async fn label_is_unique_for_team(
        &self,
        linear_team_id: &str,
        label: &str,
    ) -> Result<bool, SyncStoreError> {
        let linear_team_id = normalize_non_empty(linear_team_id, "linear_team_id")?;
        let label = normalize_non_empty(label, "label")?;
        let state = self.state.read().await;
        Ok(!state
            .syncs
            .values()
            .any(|sync| sync.linear_team_id == linear_team_id && sync.label == label))
    }

    pub async fn label_is_unique_for_repo(
        &self,
        github_repo_id: &str,
        label: &str,
    ) -> Result<bool, SyncStoreError> {
        let github_repo_id = normalize_non_empty(github_repo_id, "github_repo_id")?;
        let label = normalize_non_empty(label, "label")?;
        let state = self.state.read().await;
        Ok(!state
            .syncs
            .values()
            .any(|sync| sync.github_repo_id == github_repo_id && sync.label == label))
    }

    /// Upserts the team by external id and adds any members not yet linked.
    pub async fn upsert_team(&self, input: SaveTeamInput) -> Result<TeamRecord, SyncStoreError> {
        let team_id = normalize_non_empty(&input.team_id, "team_id")?;
        let team_name = normalize_non_empty(&input.team_name, "team_name")?;
        let todo_state_id = normalize_non_empty(&input.todo_state_id, "todo_state_id")?;
        let done_state_id = normalize_non_empty(&input.done_state_id, "done_state_id")?;
        let canceled_state_id = normalize_non_empty(&input.canceled_state_id, "canceled_state_id")?;
        let member_ids = input
            .member_ids
            .iter()
            .map(|member_id| normalize_non_empty(member_id, "member_id"))
            .collect::<Result<Vec<_>, _>>()?;
        if member_ids.is_empty() {
            return Err(SyncStoreError::Validation {
                field: "member_ids",
                message: "at least one team member is required".to_string(),
            });
        }

        self.mutate(|state| {
            let now = Utc::now();
            let team = state
                .teams
                .entry(team_id.clone())
                .and_modify(|team| {
                    team.team_name.clone_from(&team_name);
                    team.todo_state_id.clone_from(&todo_state_id);
                    team.done_state_id.clone_from(&done_state_id);
                    team.canceled_state_id.clone_from(&canceled_state_id);
                    team.updated_at = now;
                })
                .or_insert_with(|| TeamRecord {
                    id: format!("team_{}", Uuid::new_v4().simple()),
                    team_id: team_id.clone(),
                    team_name: team_name.clone(),
                    todo_state_id: todo_state_id.clone(),
                    done_state_id: done_state_id.clone(),
                    canceled_state_id: canceled_state_id.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .clone();

            for user_id in member_ids {
                state
                    .team_members
                    .entry(pair_key(&team_id, &user_id))
                    .or_insert_with(|| TeamMemberRecord {
                        team_id: team_id.clone(),
                        user_id,
                        created_at: now,
                    });
            }
            Ok(team)
        })
        .await
    }

    pub async fn team_exists(&self, team_id: &str) -> Result<bool, SyncStoreError> {
        let team_id = normalize_non_empty(team_id, "team_id")?;
        Ok(self.state.read().await.teams.contains_key(&team_id))
    }

    #[cfg(test)]
    pub(crate) async fn team_member_ids(
        &self,
        team_id: &str,
    ) -> Result<Vec<String>, SyncStoreError> {
        let team_id = normalize_non_empty(team_id, "team_id")?;
        let state = self.state.read().await;
        if !state.teams.contains_key(&team_id) {
            return Err(SyncStoreError::NotFound);
        }
        let mut members: Vec<String> = state
            .team_members
            .values()
            .filter(|member| member.team_id == team_id)
            .map(|member| member.user_id.clone())
            .collect();
        members.sort();
        Ok(members)
    }

    pub async fn upsert_user(&self, input: UpsertUserInput) -> Result<UserRecord, SyncStoreError> {
        let github_user_id = normalize_non_empty(&input.github_user_id, "github_user_id")?;
        let linear_user_id = normalize_non_empty(&input.linear_user_id, "linear_user_id")?;
        let github_username = normalize_non_empty(&input.github_username, "github_username")?;
        let linear_username = normalize_non_empty(&input.linear_username, "linear_username")?;
        let github_email =
            normalize_optional_string(input.github_email.as_deref()).unwrap_or_default();
        let linear_email =
            normalize_optional_string(input.linear_email.as_deref()).unwrap_or_default();
        let github_api_key =
            self.encrypt_secret(&normalize_non_empty(&input.github_api_key, "github_api_key")?)?;
        let linear_api_key =
            self.encrypt_secret(&normalize_non_empty(&input.linear_api_key, "linear_api_key")?)?;

        let key = pair_key(&github_user_id, &linear_user_id);
        self.mutate(|state| {
            let now = Utc::now();
            let user = state
                .users
                .entry(key)
                .and_modify(|user| {
                    user.github_username.clone_from(&github_username);
                    user.github_email.clone_from(&github_email);
                    user.linear_username.clone_from(&linear_username);
                    user.linear_email.clone_from(&linear_email);
                    user.github_api_key = github_api_key.clone();
                    user.linear_api_key = linear_api_key.clone();
                    user.updated_at = now;
                })
                .or_insert_with(|| UserRecord {
                    id: format!("user_{}", Uuid::new_v4().simple()),
                    github_user_id: github_user_id.clone(),
                    linear_user_id: linear_user_id.clone(),
                    github_username: github_username.clone(),
                    github_email: github_email.clone(),
                    linear_username: linear_username.clone(),
                    linear_email: linear_email.clone(),
                    github_api_key: github_api_key.clone(),
                    linear_api_key: linear_api_key.clone(),
                    created_at: now,
                    updated_at: now,
                });
            Ok(user.clone())
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn user(
        &self,
        github_user_id: &str,
        linear_user_id: &str,
    ) -> Result<UserRecord, SyncStoreError> {
        let key = pair_key(github_user_id.trim(), linear_user_id.trim());
        self.state
            .read()
            .await
            .users
            .get(&key)
            .cloned()
            .ok_or(SyncStoreError::NotFound)
    }

    /// Upserts the repository. An absent webhook secret keeps the stored one.
    pub async fn upsert_repo(&self, input: SaveRepoInput) -> Result<RepoRecord, SyncStoreError> {
        let repo_id = normalize_non_empty(&input.repo_id, "repo_id")?;
        let repo_name = normalize_non_empty(&input.repo_name, "repo_name")?;
        let webhook_secret = normalize_optional_string(input.webhook_secret.as_deref())
            .map(|secret| self.encrypt_secret(&secret))
            .transpose()?;

        self.mutate(|state| {
            let now = Utc::now();
            let repo = state
                .repos
                .entry(repo_id.clone())
                .and_modify(|repo| {
                    repo.repo_name.clone_from(&repo_name);
                    if let Some(secret) = webhook_secret.clone() {
                        repo.webhook_secret = Some(secret);
                    }
                    repo.updated_at = now;
                })
                .or_insert_with(|| RepoRecord {
                    repo_id: repo_id.clone(),
                    repo_name: repo_name.clone(),
                    webhook_secret: webhook_secret.clone(),
                    created_at: now,
                    updated_at: now,
                });
            Ok(repo.clone())
        })
        .await
    }

    /// Plaintext webhook secret for signature checks on GitHub deliveries.
    pub async fn repo_webhook_secret(
        &self,
        repo_id: &str,
    ) -> Result<Option<String>, SyncStoreError> {
        let repo_id = normalize_non_empty(repo_id, "repo_id")?;
        let secret = {
            let state = self.state.read().await;
            let repo = state.repos.get(&repo_id).ok_or(SyncStoreError::NotFound)?;
            repo.webhook_secret.clone()
        };
        secret.map(|secret| self.decrypt_secret(&secret)).transpose()
    }

    pub fn encrypt_secret(&self, plaintext: &str) -> Result<EncryptedSecret, SyncStoreError> {
        let Some(cipher) = self.secret_cipher.as_ref() else {
            return Err(SyncStoreError::Persistence {
                message: "secret encryption key is not configured; refusing to store API keys"
                    .to_string(),
            });
        };

        let nonce_source = Uuid::new_v4().as_bytes().to_owned();
        let nonce = Nonce::from_slice(&nonce_source[..12]);
        let aead = ChaCha20Poly1305::new_from_slice(&cipher.key).map_err(|error| {
            SyncStoreError::Persistence {
                message: format!("failed to initialize secret cipher: {error}"),
            }
        })?;
        let ciphertext = aead
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to encrypt secret: {error}"),
            })?;

        Ok(EncryptedSecret {
            key_id: cipher.key_id.clone(),
            value: URL_SAFE_NO_PAD.encode(ciphertext),
            iv: URL_SAFE_NO_PAD.encode(&nonce_source[..12]),
            fingerprint: sha256_hex(plaintext),
        })
    }

    pub fn decrypt_secret(&self, secret: &EncryptedSecret) -> Result<String, SyncStoreError> {
        let Some(cipher) = self.secret_cipher.as_ref() else {
            return Err(SyncStoreError::Persistence {
                message: "secret is encrypted but no decryption key is configured".to_string(),
            });
        };
        if secret.key_id != cipher.key_id {
            return Err(SyncStoreError::Persistence {
                message: format!("secret key id {} is not configured", secret.key_id),
            });
        }

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(secret.iv.as_bytes())
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to decode secret nonce: {error}"),
            })?;
        if nonce_raw.len() != 12 {
            return Err(SyncStoreError::Persistence {
                message: "secret nonce length is invalid".to_string(),
            });
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(secret.value.as_bytes())
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to decode secret payload: {error}"),
            })?;

        let nonce = Nonce::from_slice(nonce_raw.as_slice());
        let aead = ChaCha20Poly1305::new_from_slice(&cipher.key).map_err(|error| {
            SyncStoreError::Persistence {
                message: format!("failed to initialize secret cipher: {error}"),
            }
        })?;
        let decrypted = aead
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to decrypt secret: {error}"),
            })?;
        String::from_utf8(decrypted).map_err(|error| SyncStoreError::Persistence {
            message: format!("secret plaintext is invalid utf8: {error}"),
        })
    }

    fn load_state(path: Option<&PathBuf>) -> Result<SyncStoreState, SyncStoreError> {
        let Some(path) = path else {
            return Ok(SyncStoreState::default());
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncStoreState::default());
            }
            Err(error) => {
                return Err(SyncStoreError::Persistence {
                    message: format!("failed to read sync store {}: {error}", path.display()),
                });
            }
        };

        let state = serde_json::from_str::<SyncStoreState>(&raw).map_err(|error| {
            SyncStoreError::Persistence {
                message: format!("failed to parse sync store {}: {error}", path.display()),
            }
        })?;
        tracing::info!(
            target: STORE_TARGET,
            path = %path.display(),
            syncs = state.syncs.len(),
            teams = state.teams.len(),
            users = state.users.len(),
            repos = state.repos.len(),
            "sync store loaded",
        );
        Ok(state)
    }

    async fn persist_state(&self, snapshot: &SyncStoreState) -> Result<(), SyncStoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| SyncStoreError::Persistence {
                    message: format!("failed to prepare sync store directory: {error}"),
                })?;
        }

        let payload = serde_json::to_vec(snapshot).map_err(|error| SyncStoreError::Persistence {
            message: format!("failed to encode sync store payload: {error}"),
        })?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to write sync store payload: {error}"),
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|error| SyncStoreError::Persistence {
                message: format!("failed to finalize sync store payload: {error}"),
            })?;

        Ok(())
    }

    async fn mutate<T, F>(&self, operation: F) -> Result<T, SyncStoreError>
    where
        F: FnOnce(&mut SyncStoreState) -> Result<T, SyncStoreError>,
    {
        // The write guard is held until the snapshot is on disk, so snapshots
        // land in the same order as the mutations that produced them.
        let mut state = self.state.write().await;
        let previous = state.clone();
        let outcome = match operation(&mut state) {
            Ok(result) => self.persist_state(&state).await.map(|()| result),
            Err(error) => Err(error),
        };
        if outcome.is_err() {
            *state = previous;
        }
        outcome
    }
}

fn secret_cipher_from_config(config: &Config) -> Option<SecretCipher> {
    let encoded_key = config.secret_encryption_key.as_deref()?.trim();
    if encoded_key.is_empty() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD
        .decode(encoded_key.trim_end_matches('=').as_bytes())
        .or_else(|_| STANDARD.decode(encoded_key.as_bytes()));
    let key = match decoded {
        Ok(bytes) if bytes.len() == 32 => {
            let mut material = [0u8; 32];
            material.copy_from_slice(bytes.as_slice());
            material
        }
        Ok(bytes) => {
            tracing::warn!(
                target: STORE_TARGET,
                key_bytes = bytes.len(),
                "secret encryption key ignored: expected 32-byte base64 value",
            );
            return None;
        }
        Err(error) => {
            tracing::warn!(
                target: STORE_TARGET,
                error = %error,
                "secret encryption key ignored: invalid base64 payload",
            );
            return None;
        }
    };

    Some(SecretCipher {
        key_id: config.secret_key_id.clone(),
        key,
    })
}

fn sync_key(
    github_user_id: &str,
    linear_user_id: &str,
    github_repo_id: &str,
    linear_team_id: &str,
) -> String {
    format!("{github_user_id}:{linear_user_id}:{github_repo_id}:{linear_team_id}")
}

fn pair_key(left: &str, right: &str) -> String {
    format!("{left}:{right}")
}

fn sha256_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn normalize_non_empty(value: &str, field: &'static str) -> Result<String, SyncStoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncStoreError::Validation {
            field,
            message: "value is required".to_string(),
        });
    }

    Ok(trimmed.to_string())
}

fn normalize_optional_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    fn sync_input(label: &str) -> SaveSyncInput {
        SaveSyncInput {
            github_user_id: "1001".to_string(),
            github_repo_id: "555".to_string(),
            github_api_key: "gho_first".to_string(),
            github_label_id: "gh-label-1".to_string(),
            linear_user_id: "lin-user".to_string(),
            linear_team_id: "team-1".to_string(),
            linear_api_key: "lin_first".to_string(),
            label: label.to_string(),
            linear_label_id: "lin-label-1".to_string(),
        }
    }

    #[tokio::test]
    async fn resaving_a_pairing_updates_the_single_record() -> Result<()> {
        let store = SyncStore::from_config(&Config::for_tests(None))?;

        let first = store.upsert_sync(sync_input("linear")).await?;
        let mut second_input = sync_input("synced");
        second_input.github_api_key = "gho_second".to_string();
        second_input.github_label_id = "gh-label-2".to_string();
        let second = store.upsert_sync(second_input).await?;

        assert_eq!(first.id, second.id);
        assert_eq!(second.label, "synced");
        assert_eq!(second.github_label_id, "gh-label-2");
        assert_eq!(store.decrypt_secret(&second.github_api_key)?, "gho_second");
        assert_eq!(store.state.read().await.syncs.len(), 1);

        assert!(store.label_is_unique_for_team("team-1", "linear").await?);
        assert!(!store.label_is_unique_for_team("team-1", "synced").await?);
        assert!(!store.label_is_unique_for_repo("555", "synced").await?);
        assert!(store.label_is_unique_for_repo("556", "synced").await?);
        Ok(())
    }

    #[tokio::test]
    async fn api_keys_are_never_stored_without_a_cipher() -> Result<()> {
        let mut config = Config::for_tests(None);
        config.secret_encryption_key = None;
        let store = SyncStore::from_config(&config)?;

        let error = store
            .upsert_sync(sync_input("linear"))
            .await
            .expect_err("plaintext keys must be refused");
        assert!(matches!(error, SyncStoreError::Persistence { .. }));
        assert!(!store.sync_exists("555", "team-1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn decryption_rejects_unknown_key_ids() -> Result<()> {
        let store = SyncStore::from_config(&Config::for_tests(None))?;
        let mut secret = store.encrypt_secret("whsec_value")?;
        assert_ne!(secret.value, "whsec_value");
        assert_eq!(URL_SAFE_NO_PAD.decode(secret.iv.as_bytes())?.len(), 12);

        secret.key_id = "retired".to_string();
        assert!(store.decrypt_secret(&secret).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn team_upsert_links_members_once() -> Result<()> {
        let store = SyncStore::from_config(&Config::for_tests(None))?;
        let input = SaveTeamInput {
            team_id: "team-1".to_string(),
            team_name: "Core".to_string(),
            todo_state_id: "s-todo".to_string(),
            done_state_id: "s-done".to_string(),
            canceled_state_id: "s-cancel".to_string(),
            member_ids: vec!["u-2".to_string(), "u-1".to_string()],
        };
        let first = store.upsert_team(input.clone()).await?;

        let mut renamed = input;
        renamed.team_name = "Core Platform".to_string();
        renamed.member_ids = vec!["u-1".to_string(), "u-3".to_string()];
        let second = store.upsert_team(renamed).await?;

        assert_eq!(first.id, second.id);
        assert_eq!(second.team_name, "Core Platform");
        assert!(store.team_exists("team-1").await?);
        assert!(!store.team_exists("team-2").await?);
        assert_eq!(store.team_member_ids("team-1").await?, vec!["u-1", "u-2", "u-3"]);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_survives_restart() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::for_tests(Some(dir.path().join("store").join("sync-store.json")));

        let store = SyncStore::from_config(&config)?;
        store.upsert_sync(sync_input("linear")).await?;
        store
            .upsert_repo(SaveRepoInput {
                repo_id: "555".to_string(),
                repo_name: "acme/widgets".to_string(),
                webhook_secret: Some("whsec_1".to_string()),
            })
            .await?;
        store
            .upsert_repo(SaveRepoInput {
                repo_id: "555".to_string(),
                repo_name: "acme/widgets-renamed".to_string(),
                webhook_secret: None,
            })
            .await?;

        let reloaded = SyncStore::from_config(&config)?;
        assert!(reloaded.sync_exists("555", "team-1").await?);
        assert_eq!(reloaded.repo_webhook_secret("555").await?.as_deref(), Some("whsec_1"));
        assert!(matches!(
            reloaded.repo_webhook_secret("404").await,
            Err(SyncStoreError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_snapshot_refuses_to_boot_and_is_left_untouched() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sync-store.json");
        std::fs::write(&path, "{not json")?;

        let result = SyncStore::from_config(&Config::for_tests(Some(path.clone())));
        assert!(matches!(
            result,
            Err(SyncStoreError::Persistence { ref message })
                if message.contains("failed to parse sync store")
        ));
        assert_eq!(std::fs::read_to_string(&path)?, "{not json");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_upserts_all_reach_disk() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::for_tests(Some(dir.path().join("sync-store.json")));
        let store = SyncStore::from_config(&config)?;

        let mut writers = tokio::task::JoinSet::new();
        for index in 0..32 {
            let store = store.clone();
            writers.spawn(async move {
                let mut input = sync_input("linear");
                input.github_repo_id = format!("repo-{index}");
                store.upsert_sync(input).await
            });
        }
        while let Some(writer) = writers.join_next().await {
            writer??;
        }

        let reloaded = SyncStore::from_config(&config)?;
        assert_eq!(reloaded.state.read().await.syncs.len(), 32);
        for index in 0..32 {
            assert!(reloaded.sync_exists(&format!("repo-{index}"), "team-1").await?);
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_the_mutation() -> Result<()> {
        let dir = tempdir()?;
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file")?;
        let path = blocker.join("sync-store.json");
        let store = SyncStore::from_config(&Config::for_tests(Some(path)))?;

        let result = store.upsert_sync(sync_input("linear")).await;
        assert!(matches!(result, Err(SyncStoreError::Persistence { .. })));
        assert!(!store.sync_exists("555", "team-1").await?);
        Ok(())
    }
}
