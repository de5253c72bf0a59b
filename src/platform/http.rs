//! [`MembershipClient`] over a JSON HTTP bridge.
//!
//! The bridge fronts the real messaging platform session:
//!
//! - `GET  {base}/groups/{group_id}/members` → JSON array of user objects
//!   (or `{"members": [...]}`)
//! - `POST {base}/messages` with `{"chat_id": .., "text": ..}`
//!
//! User objects are loosely typed; [`normalize_member`] turns them into
//! [`MemberProfile`] right here so nothing untyped crosses into the core.
//! Requests are blocking `ureq` calls moved onto the blocking pool.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{MembershipClient, PlatformError};
use crate::profile::{GroupId, MemberProfile, Profile};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest `Retry-After` taken from the bridge; larger values are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3_600);

#[derive(Clone)]
pub struct HttpPlatformClient {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpPlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPlatformClient")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

impl HttpPlatformClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            agent,
        }
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {token}")),
            None => request,
        }
    }

    fn fetch_members_blocking(&self, group_id: GroupId) -> Result<Vec<MemberProfile>, PlatformError> {
        let url = format!("{}/groups/{}/members", self.base_url, group_id);
        let response = self
            .authorize(self.agent.get(&url))
            .call()
            .map_err(map_ureq_error)?;
        let body: Value = response
            .into_json()
            .map_err(|e| PlatformError::Network(format!("deserialize members: {e}")))?;
        parse_member_list(body)
    }

    fn send_message_blocking(&self, chat_id: i64, text: &str) -> Result<(), PlatformError> {
        let url = format!("{}/messages", self.base_url);
        self.authorize(self.agent.post(&url))
            .send_json(json!({ "chat_id": chat_id, "text": text }))
            .map_err(map_ureq_error)?;
        Ok(())
    }
}

#[async_trait]
impl MembershipClient for HttpPlatformClient {
    async fn fetch_members(&self, group_id: GroupId) -> Result<Vec<MemberProfile>, PlatformError> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.fetch_members_blocking(group_id))
            .await
            .map_err(|e| PlatformError::Network(format!("fetch task failed: {e}")))?
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), PlatformError> {
        let client = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.send_message_blocking(chat_id, &text))
            .await
            .map_err(|e| PlatformError::Network(format!("send task failed: {e}")))?
    }
}

fn map_ureq_error(error: ureq::Error) -> PlatformError {
    match error {
        ureq::Error::Status(code, response) => match code {
            401 | 403 | 404 => PlatformError::AccessDenied(format!("bridge returned {code}")),
            429 => {
                let header = response
                    .header("Retry-After")
                    .and_then(|v| v.trim().parse::<u64>().ok());
                let body = response
                    .into_json::<Value>()
                    .ok()
                    .and_then(|v| retry_after_from_body(&v));
                PlatformError::RateLimited {
                    retry_after: header.or(body).map(clamp_retry_after),
                }
            }
            _ => PlatformError::Network(format!("bridge returned {code}")),
        },
        ureq::Error::Transport(transport) => PlatformError::Network(transport.to_string()),
    }
}

fn clamp_retry_after(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_RETRY_AFTER)
}

fn retry_after_from_body(body: &Value) -> Option<u64> {
    body.get("retry_after")
        .or_else(|| body.pointer("/parameters/retry_after"))
        .and_then(Value::as_u64)
}

/// Accept either a bare array or an object with a `members` array.
pub fn parse_member_list(body: Value) -> Result<Vec<MemberProfile>, PlatformError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("members") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(PlatformError::Network(
                    "member list response has no members array".to_string(),
                ))
            }
        },
        _ => {
            return Err(PlatformError::Network(
                "member list response is not a list".to_string(),
            ))
        }
    };
    let total = items.len();
    let members: Vec<MemberProfile> = items.iter().filter_map(normalize_member).collect();
    if members.len() != total {
        debug!(
            skipped = total - members.len(),
            "platform: skipped non-user entries in member list"
        );
    }
    Ok(members)
}

/// Normalise one loosely typed user object. Returns `None` for entries that
/// are not users or carry no usable id.
pub fn normalize_member(value: &Value) -> Option<MemberProfile> {
    let object = value.as_object()?;
    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        if kind != "user" {
            return None;
        }
    }
    let member_id = match object.get("id")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let profile = Profile {
        first_name: text_field(object, &["first_name"]),
        last_name: text_field(object, &["last_name"]),
        handle: text_field(object, &["username", "handle"])
            .map(|h| h.trim_start_matches('@').to_string()),
        phone: text_field(object, &["phone", "phone_number"]),
    };
    Some(MemberProfile::new(member_id, profile))
}

/// First string-or-number value under any of `keys`, trimmed, non-empty.
fn text_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileField;

    #[test]
    fn normalizes_loose_user_objects() {
        let member = normalize_member(&json!({
            "id": "12345",
            "first_name": " Alice ",
            "last_name": "",
            "username": "@alice",
            "phone_number": 15550100,
            "is_bot": false
        }))
        .unwrap();
        assert_eq!(member.member_id, 12345);
        assert_eq!(member.profile.get(ProfileField::FirstName), Some("Alice"));
        assert_eq!(member.profile.get(ProfileField::LastName), None);
        assert_eq!(member.profile.get(ProfileField::Handle), Some("alice"));
        assert_eq!(member.profile.get(ProfileField::Phone), Some("15550100"));
    }

    #[test]
    fn skips_non_users_and_missing_ids() {
        assert!(normalize_member(&json!({"type": "channel", "id": 1})).is_none());
        assert!(normalize_member(&json!({"first_name": "NoId"})).is_none());
        assert!(normalize_member(&json!({"id": [1]})).is_none());
        assert!(normalize_member(&json!("not an object")).is_none());
    }

    #[test]
    fn parses_both_list_shapes() {
        let bare = parse_member_list(json!([{"id": 1}, {"type": "bot", "id": 2}])).unwrap();
        assert_eq!(bare.len(), 1);

        let wrapped = parse_member_list(json!({"members": [{"id": 1}, {"id": 3}]})).unwrap();
        assert_eq!(wrapped.len(), 2);

        assert!(parse_member_list(json!({"ok": true})).is_err());
        assert!(parse_member_list(json!(7)).is_err());
    }

    #[test]
    fn retry_after_is_read_from_body() {
        assert_eq!(retry_after_from_body(&json!({"retry_after": 12})), Some(12));
        assert_eq!(
            retry_after_from_body(&json!({"parameters": {"retry_after": 3}})),
            Some(3)
        );
        assert_eq!(retry_after_from_body(&json!({})), None);
    }

    #[test]
    fn retry_after_is_clamped() {
        assert_eq!(clamp_retry_after(7), Duration::from_secs(7));
        assert_eq!(clamp_retry_after(u64::MAX), MAX_RETRY_AFTER);
    }
}
