//! Values passed from the scanner to the notifier and back to callers.

use serde::{Deserialize, Serialize};

use crate::platform::PlatformError;
use crate::profile::{FieldChange, GroupId, MemberId, Profile};
use crate::storage::GroupRow;

/// Group id plus the title it had when the event was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupRef {
    pub group_id: GroupId,
    pub title: String,
}

impl From<&GroupRow> for GroupRef {
    fn from(row: &GroupRow) -> Self {
        Self {
            group_id: row.group_id,
            title: row.title.clone(),
        }
    }
}

/// Every field change detected for one member in one scan cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub member_id: MemberId,
    /// Profile after the change.
    pub profile: Profile,
    pub changes: Vec<FieldChange>,
    /// Groups the member was observed in when the change was detected.
    pub groups: Vec<GroupRef>,
    pub detected_at: u64,
}

/// A group whose member list could not be fetched during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupError {
    pub group: GroupRef,
    pub error: PlatformError,
}

/// A member whose update was aborted by a storage failure; retried next scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberError {
    pub member_id: MemberId,
    pub error: String,
}
