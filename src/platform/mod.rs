//! The messaging platform as seen by the core.
//!
//! The scanner and notifier only ever talk to the platform through
//! [`MembershipClient`]: enumerate a group's members, send a text message.
//! Every platform failure is folded into one of the three [`PlatformError`]
//! kinds before it reaches the core.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::profile::{GroupId, MemberProfile};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The bot can no longer read the group (removed, not admin, group gone).
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// The platform asked us to slow down.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    Network(String),
}

impl PlatformError {
    /// Rate limits and network errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PlatformError::AccessDenied(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Member enumeration and message sending.
///
/// Implementations must normalise platform payloads into [`MemberProfile`]
/// and skip entries that are not users.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    async fn fetch_members(&self, group_id: GroupId) -> Result<Vec<MemberProfile>, PlatformError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), PlatformError>;
}
