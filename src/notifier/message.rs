//! Admin-facing notices and their rendered text.
//!
//! Rendered text never carries counters or attempt numbers, so receiving
//! the same notice twice after a retry is harmless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{ChangeEvent, GroupRef};
use crate::profile::{FieldChange, MemberId};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━";
const NONE: &str = "(none)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    ProfileChanged {
        member_id: MemberId,
        name: String,
        groups: Vec<GroupRef>,
        changes: Vec<FieldChange>,
    },
    GroupDeactivated {
        group: GroupRef,
        reason: String,
    },
    GroupUnreachable {
        group: GroupRef,
        reason: String,
    },
    MemberLeft {
        member_id: MemberId,
        name: String,
        group: GroupRef,
        remaining: Vec<GroupRef>,
    },
    Startup {
        members_tracked: u64,
        groups: Vec<GroupRef>,
    },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::ProfileChanged { .. } => "profile_changed",
            Notice::GroupDeactivated { .. } => "group_deactivated",
            Notice::GroupUnreachable { .. } => "group_unreachable",
            Notice::MemberLeft { .. } => "member_left",
            Notice::Startup { .. } => "startup",
        }
    }

    /// Member this notice is about, if it may be merged with others for the
    /// same member.
    pub fn merge_key(&self) -> Option<MemberId> {
        match self {
            Notice::ProfileChanged { member_id, .. } => Some(*member_id),
            _ => None,
        }
    }

    /// Fold a later notice for the same member into this one: groups are
    /// unioned and changes appended in detection order. Returns `other`
    /// unchanged when the two cannot be merged.
    pub fn absorb(&mut self, other: Notice) -> Result<(), Notice> {
        if self.merge_key().is_none() || self.merge_key() != other.merge_key() {
            return Err(other);
        }
        let (
            Notice::ProfileChanged {
                name,
                groups,
                changes,
                ..
            },
            Notice::ProfileChanged {
                name: later_name,
                groups: later_groups,
                changes: later_changes,
                ..
            },
        ) = (self, other)
        else {
            return Ok(());
        };
        *name = later_name;
        for group in later_groups {
            if !groups.iter().any(|g| g.group_id == group.group_id) {
                groups.push(group);
            }
        }
        changes.extend(later_changes);
        Ok(())
    }

    pub fn render(&self) -> String {
        match self {
            Notice::ProfileChanged {
                member_id,
                name,
                groups,
                changes,
            } => {
                let mut out = format!(
                    "🔔 Name Change Notification\n{RULE}\n👤 User ID: `{member_id}`\n📛 Name: {name}\n👥 Groups: {}\n\n",
                    titles(groups)
                );
                for change in changes {
                    out.push_str(&format!(
                        "✏️ {}: {} → {}\n",
                        change.field.label(),
                        change.old.as_deref().unwrap_or(NONE),
                        change.new.as_deref().unwrap_or(NONE),
                    ));
                }
                out.push_str(RULE);
                out
            }
            Notice::GroupDeactivated { group, reason } => format!(
                "⛔ Monitoring stopped\n{RULE}\n👥 Group: {} (`{}`)\nThe bot can no longer read this group: {reason}\nSend /start in the group to resume.",
                group.title, group.group_id
            ),
            Notice::GroupUnreachable { group, reason } => format!(
                "⚠️ Group unreachable\n{RULE}\n👥 Group: {} (`{}`)\nMember list could not be fetched for several scans in a row: {reason}",
                group.title, group.group_id
            ),
            Notice::MemberLeft {
                member_id,
                name,
                group,
                remaining,
            } => {
                let still_in = if remaining.is_empty() {
                    "no other monitored groups".to_string()
                } else {
                    titles(remaining)
                };
                format!(
                    "👋 Member left\n{RULE}\n👤 User ID: `{member_id}`\n📛 Name: {name}\n👥 Left: {}\n📌 Still in: {still_in}",
                    group.title
                )
            }
            Notice::Startup {
                members_tracked,
                groups,
            } => {
                let monitored = if groups.is_empty() {
                    "none yet, send /start in a group".to_string()
                } else {
                    titles(groups)
                };
                format!(
                    "✅ Name watch started\n{RULE}\n👤 Members tracked: {members_tracked}\n👥 Groups: {monitored}"
                )
            }
        }
    }
}

fn titles(groups: &[GroupRef]) -> String {
    groups
        .iter()
        .map(|g| g.title.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One [`Notice`] per member, in order of first appearance. Events for the
/// same member are merged so a member seen in several groups during one
/// scan produces a single notification.
pub fn coalesce(events: impl IntoIterator<Item = ChangeEvent>) -> Vec<Notice> {
    let mut order: Vec<MemberId> = Vec::new();
    let mut by_member: BTreeMap<MemberId, Notice> = BTreeMap::new();
    for event in events {
        let notice = Notice::ProfileChanged {
            member_id: event.member_id,
            name: event.profile.display_name(),
            groups: event.groups,
            changes: event.changes,
        };
        match by_member.get_mut(&event.member_id) {
            Some(existing) => {
                // Same member id on both sides, so this always merges.
                let _ = existing.absorb(notice);
            }
            None => {
                order.push(event.member_id);
                by_member.insert(event.member_id, notice);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| by_member.remove(&id))
        .collect()
}
