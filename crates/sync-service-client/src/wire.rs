//! JSON bodies of the sync record service routes.
//!
//! Request fields are optional on the wire so the service can report the
//! first missing one with a route-specific message. Identifiers are accepted
//! as JSON strings or numbers (GitHub ids are numeric, Linear ids are UUIDs)
//! and always carried as strings.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const CHECK_PATH: &str = "/check";
pub const SAVE_PATH: &str = "/save";
pub const LINEAR_LABEL_PATH: &str = "/linear/label";
pub const GITHUB_LABEL_PATH: &str = "/github/label";
pub const LINEAR_SAVE_PATH: &str = "/linear/save";
pub const LINEAR_TEAM_PATH: &str = "/linear/team";
pub const GITHUB_SAVE_PATH: &str = "/github/save";
pub const USER_PATH: &str = "/user";

/// Deserializes an identifier given as a string or a number. Blank strings
/// and `null` read as absent.
pub fn flexible_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "identifier must be a string or a number, got {other}"
        ))),
    }
}

fn non_blank<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.trim().is_empty()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSyncRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub github_repo_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub linear_team_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubSyncSide {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub github_label_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearSyncSide {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub linear_label_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSyncRequest {
    #[serde(default)]
    pub github: GitHubSyncSide,
    #[serde(default)]
    pub linear: LinearSyncSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearLabelCheckRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubLabelCheckRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelCheckResponse {
    pub checking_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMemberRef {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveLinearTeamRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    #[serde(
        default,
        rename = "toDoStateId",
        deserialize_with = "flexible_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub todo_state_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub done_state_id: Option<String>,
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub canceled_state_id: Option<String>,
    #[serde(default)]
    pub members: Vec<TeamMemberRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub team_id: String,
    pub team_name: String,
    #[serde(rename = "toDoStateId")]
    pub todo_state_id: String,
    pub done_state_id: String,
    pub canceled_state_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearTeamRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveGitHubRepoRequest {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    pub repo_id: String,
    pub repo_name: String,
    pub has_webhook_secret: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSide {
    #[serde(default, deserialize_with = "flexible_id", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "non_blank", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertUserRequest {
    #[serde(default)]
    pub github: UserSide,
    #[serde(default)]
    pub linear: UserSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Failure body. The service answers with `{error}` for route failures and
/// `{message}` for envelope failures (wrong method, missing body).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn text(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identifiers_accept_strings_and_numbers() {
        let request: CheckSyncRequest = serde_json::from_value(json!({
            "githubRepoId": 123_456,
            "linearTeamId": " 0b6c-team "
        }))
        .expect("decode check request");
        assert_eq!(request.github_repo_id.as_deref(), Some("123456"));
        assert_eq!(request.linear_team_id.as_deref(), Some("0b6c-team"));

        let blank: CheckSyncRequest =
            serde_json::from_value(json!({ "githubRepoId": "", "linearTeamId": null }))
                .expect("decode blank request");
        assert_eq!(blank, CheckSyncRequest::default());

        let invalid = serde_json::from_value::<CheckSyncRequest>(json!({ "githubRepoId": [1] }));
        assert!(invalid.is_err());
    }

    #[test]
    fn team_request_uses_legacy_todo_field_name() {
        let request = SaveLinearTeamRequest {
            team_id: Some("team-1".to_string()),
            team_name: Some("Core".to_string()),
            todo_state_id: Some("s-todo".to_string()),
            done_state_id: Some("s-done".to_string()),
            canceled_state_id: Some("s-cancel".to_string()),
            members: vec![TeamMemberRef {
                id: Some("u-1".to_string()),
            }],
        };
        let value = serde_json::to_value(&request).expect("encode team request");
        assert_eq!(value["toDoStateId"], "s-todo");
        assert_eq!(value["members"][0]["id"], "u-1");
    }

    #[test]
    fn error_body_prefers_error_field() {
        let body: ErrorBody =
            serde_json::from_value(json!({ "message": "Only POST requests are accepted." }))
                .expect("decode error body");
        assert_eq!(body.text(), Some("Only POST requests are accepted."));
    }
}
