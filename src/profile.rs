//! Tracked profile fields and the pure differ.
//!
//! A [`Profile`] is the strongly typed view of a member that the rest of the
//! crate works with; platform payloads are normalised into it at the client
//! boundary. [`diff`] compares two profiles field by field and reports every
//! field whose value actually changed.

use serde::{Deserialize, Serialize};

/// Platform-assigned member id.
pub type MemberId = i64;
/// Platform-assigned group id.
pub type GroupId = i64;

/// A tracked profile attribute.
///
/// The declaration order is the order in which changes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    FirstName,
    LastName,
    Handle,
    Phone,
}

impl ProfileField {
    pub const ALL: [ProfileField; 4] = [
        ProfileField::FirstName,
        ProfileField::LastName,
        ProfileField::Handle,
        ProfileField::Phone,
    ];

    /// Column / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileField::FirstName => "first_name",
            ProfileField::LastName => "last_name",
            ProfileField::Handle => "handle",
            ProfileField::Phone => "phone",
        }
    }

    /// Human-facing label used in notifications.
    pub fn label(&self) -> &'static str {
        match self {
            ProfileField::FirstName => "First name",
            ProfileField::LastName => "Last name",
            ProfileField::Handle => "Username",
            ProfileField::Phone => "Phone",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ProfileField::ALL
            .into_iter()
            .find(|field| field.as_str() == value)
    }
}

impl std::fmt::Display for ProfileField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known or freshly fetched profile values. Every field is optional;
/// an empty string and an absent value mean the same thing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub handle: Option<String>,
    pub phone: Option<String>,
}

impl Profile {
    pub fn get(&self, field: ProfileField) -> Option<&str> {
        let value = match field {
            ProfileField::FirstName => &self.first_name,
            ProfileField::LastName => &self.last_name,
            ProfileField::Handle => &self.handle,
            ProfileField::Phone => &self.phone,
        };
        normalize(value.as_deref())
    }

    pub fn set(&mut self, field: ProfileField, value: Option<String>) {
        let value = value.filter(|v| !v.is_empty());
        match field {
            ProfileField::FirstName => self.first_name = value,
            ProfileField::LastName => self.last_name = value,
            ProfileField::Handle => self.handle = value,
            ProfileField::Phone => self.phone = value,
        }
    }

    /// Same values with empty strings collapsed to `None`.
    pub fn normalized(&self) -> Profile {
        let mut out = Profile::default();
        for field in ProfileField::ALL {
            out.set(field, self.get(field).map(str::to_string));
        }
        out
    }

    /// "First Last" for admin notices, falling back to the handle.
    pub fn display_name(&self) -> String {
        let name = [self.get(ProfileField::FirstName), self.get(ProfileField::LastName)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            return name;
        }
        match self.get(ProfileField::Handle) {
            Some(handle) => format!("@{handle}"),
            None => "(no name)".to_string(),
        }
    }
}

/// A member as returned by the platform: id plus current profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member_id: MemberId,
    pub profile: Profile,
}

impl MemberProfile {
    pub fn new(member_id: MemberId, profile: Profile) -> Self {
        Self {
            member_id,
            profile: profile.normalized(),
        }
    }
}

/// One differing attribute between a stored snapshot and a fetched profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: ProfileField,
    pub old: Option<String>,
    pub new: Option<String>,
}

fn normalize(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Compare `old` against `new`, one [`FieldChange`] per differing field in
/// [`ProfileField::ALL`] order. Absent and empty values compare equal.
pub fn diff(old: &Profile, new: &Profile) -> Vec<FieldChange> {
    ProfileField::ALL
        .into_iter()
        .filter_map(|field| {
            let before = old.get(field);
            let after = new.get(field);
            (before != after).then(|| FieldChange {
                field,
                old: before.map(str::to_string),
                new: after.map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(first: &str, last: &str, handle: &str, phone: &str) -> Profile {
        let opt = |s: &str| Some(s.to_string());
        Profile {
            first_name: opt(first),
            last_name: opt(last),
            handle: opt(handle),
            phone: opt(phone),
        }
    }

    #[test]
    fn diff_of_identical_profiles_is_empty() {
        let samples = [
            Profile::default(),
            profile("Alice", "", "alice", "+100"),
            profile("", "", "", ""),
            profile("Ünïcode", "名前", "x", "+44 20"),
        ];
        for p in &samples {
            assert!(diff(p, p).is_empty(), "spurious change for {p:?}");
        }
    }

    #[test]
    fn single_field_change_reports_exactly_that_field() {
        let base = profile("Alice", "Smith", "alice", "+100");
        for field in ProfileField::ALL {
            let mut changed = base.clone();
            changed.set(field, Some("other".to_string()));
            let changes = diff(&base, &changed);
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].field, field);
            assert_eq!(changes[0].old.as_deref(), base.get(field));
            assert_eq!(changes[0].new.as_deref(), Some("other"));
        }
    }

    #[test]
    fn absent_and_empty_are_equivalent() {
        let absent = Profile::default();
        let empty = profile("", "", "", "");
        assert!(diff(&absent, &empty).is_empty());
        assert!(diff(&empty, &absent).is_empty());
    }

    #[test]
    fn clearing_a_value_is_a_change() {
        let old = profile("Alice", "Smith", "", "");
        let new = profile("Alice", "", "", "");
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![FieldChange {
                field: ProfileField::LastName,
                old: Some("Smith".to_string()),
                new: None,
            }]
        );
    }

    #[test]
    fn changes_follow_fixed_field_order() {
        let old = profile("a", "b", "c", "d");
        let new = profile("w", "x", "y", "z");
        let fields: Vec<_> = diff(&old, &new).into_iter().map(|c| c.field).collect();
        assert_eq!(fields, ProfileField::ALL.to_vec());
    }

    #[test]
    fn field_names_round_trip_through_parse() {
        for field in ProfileField::ALL {
            assert_eq!(ProfileField::parse(field.as_str()), Some(field));
        }
        assert_eq!(ProfileField::parse("username"), None);
    }

    #[test]
    fn display_name_falls_back_to_handle() {
        assert_eq!(profile("Alice", "Smith", "", "").display_name(), "Alice Smith");
        assert_eq!(profile("", "", "al", "").display_name(), "@al");
        assert_eq!(Profile::default().display_name(), "(no name)");
    }
}
