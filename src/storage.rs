//! SQLite storage layer for namewatch.
//!
//! Owns the schema and every SQL statement: member snapshots, the group
//! registry, memberships, the append-only change history, and the
//! notification outbox. Higher-level handles ([`crate::snapshot`],
//! [`crate::registry`]) share one [`Storage`] through [`SharedStorage`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::profile::{FieldChange, GroupId, MemberId, Profile, ProfileField};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Current snapshot of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRow {
    pub member_id: MemberId,
    pub profile: Profile,
    pub first_seen: u64,
    pub updated_at: u64,
}

/// Monitored group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRow {
    pub group_id: GroupId,
    pub title: String,
    pub active: bool,
    pub registered_at: u64,
    /// Consecutive scans that ended in AccessDenied.
    pub access_failures: u32,
    /// Consecutive scans that ended in a transient platform error.
    pub transient_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub member_id: MemberId,
    pub group_id: GroupId,
    pub joined_at: u64,
    pub active: bool,
    pub missed_scans: u32,
}

/// Append-only history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub member_id: MemberId,
    pub field: ProfileField,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: u64,
    pub group_ids: Vec<GroupId>,
}

/// Queued notification waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    pub id: i64,
    pub payload: String,
    pub queued_at: u64,
}

/// Which kind of platform failure a group fetch ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AccessDenied,
    Transient,
}

/// Failure streaks after recording a group failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounts {
    pub access_failures: u32,
    pub transient_failures: u32,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Storage shared between the scanner, registry, notifier and admin surface.
pub type SharedStorage = Arc<Mutex<Storage>>;

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    pub fn into_shared(self) -> SharedStorage {
        Arc::new(Mutex::new(self))
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS members (
                member_id   INTEGER PRIMARY KEY,
                first_name  TEXT,
                last_name   TEXT,
                handle      TEXT,
                phone       TEXT,
                first_seen  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                group_id            INTEGER PRIMARY KEY,
                title               TEXT NOT NULL,
                active              INTEGER NOT NULL DEFAULT 1,
                registered_at       INTEGER NOT NULL,
                access_failures     INTEGER NOT NULL DEFAULT 0,
                transient_failures  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS memberships (
                member_id     INTEGER NOT NULL REFERENCES members(member_id),
                group_id      INTEGER NOT NULL REFERENCES groups(group_id),
                joined_at     INTEGER NOT NULL,
                active        INTEGER NOT NULL DEFAULT 1,
                missed_scans  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (member_id, group_id)
            );

            CREATE INDEX IF NOT EXISTS idx_memberships_group
                ON memberships(group_id, active);

            CREATE TABLE IF NOT EXISTS name_changes (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id    INTEGER NOT NULL REFERENCES members(member_id),
                field        TEXT NOT NULL
                    CHECK (field IN ('first_name', 'last_name', 'handle', 'phone')),
                old_value    TEXT,
                new_value    TEXT,
                detected_at  INTEGER NOT NULL,
                group_ids    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_name_changes_member
                ON name_changes(member_id, id);

            CREATE TABLE IF NOT EXISTS outbox (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                payload    TEXT NOT NULL,
                queued_at  INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Members
    // -----------------------------------------------------------------------

    pub fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id, first_name, last_name, handle, phone, first_seen, updated_at
             FROM members WHERE member_id = ?1",
        )?;
        let row = stmt
            .query_row(params![member_id], member_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn count_members(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM members", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Register a never-seen member together with its first memberships.
    /// Returns `false` if the member already existed (nothing is written).
    pub fn insert_member_with_memberships(
        &self,
        member_id: MemberId,
        profile: &Profile,
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let profile = profile.normalized();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO members
             (member_id, first_name, last_name, handle, phone, first_seen, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                member_id,
                profile.first_name,
                profile.last_name,
                profile.handle,
                profile.phone,
                now as i64,
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        for group_id in group_ids {
            upsert_membership(&tx, member_id, *group_id, now)?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Overwrite the snapshot and append one history row per change, all or
    /// nothing.
    pub fn apply_scan_result(
        &self,
        member_id: MemberId,
        new_profile: &Profile,
        changes: &[FieldChange],
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let profile = new_profile.normalized();
        let updated = tx.execute(
            "UPDATE members
             SET first_name = ?2, last_name = ?3, handle = ?4, phone = ?5, updated_at = ?6
             WHERE member_id = ?1",
            params![
                member_id,
                profile.first_name,
                profile.last_name,
                profile.handle,
                profile.phone,
                now as i64,
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::NotFound(format!("member {member_id}")));
        }

        let group_json = serde_json::to_string(group_ids)?;
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            tx.execute(
                "INSERT INTO name_changes
                 (member_id, field, old_value, new_value, detected_at, group_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    member_id,
                    change.field.as_str(),
                    change.old,
                    change.new,
                    now as i64,
                    group_json,
                ],
            )?;
            records.push(ChangeRecord {
                id: tx.last_insert_rowid(),
                member_id,
                field: change.field,
                old_value: change.old.clone(),
                new_value: change.new.clone(),
                detected_at: now,
                group_ids: group_ids.to_vec(),
            });
        }
        tx.commit()?;
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Change history
    // -----------------------------------------------------------------------

    /// History page for a member, oldest first, strictly after `after_id`.
    pub fn list_changes(
        &self,
        member_id: MemberId,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, member_id, field, old_value, new_value, detected_at, group_ids
             FROM name_changes
             WHERE member_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![member_id, after_id.unwrap_or(0), limit as i64],
            change_from_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row??);
        }
        Ok(result)
    }

    /// Latest `limit` history rows, newest first.
    pub fn recent_changes(
        &self,
        member_id: MemberId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, member_id, field, old_value, new_value, detected_at, group_ids
             FROM name_changes
             WHERE member_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![member_id, limit as i64], change_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row??);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Memberships
    // -----------------------------------------------------------------------

    /// Mark `member_id` as present in each group. New memberships are
    /// created, inactive or previously missed ones are reset; already-active
    /// memberships are left untouched. Returns the number of rows mutated.
    pub fn observe_memberships(
        &self,
        member_id: MemberId,
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut mutated = 0;
        for group_id in group_ids {
            mutated += upsert_membership(&tx, member_id, *group_id, now)?;
        }
        tx.commit()?;
        Ok(mutated)
    }

    pub fn get_membership(
        &self,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<Option<MembershipRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id, group_id, joined_at, active, missed_scans
             FROM memberships WHERE member_id = ?1 AND group_id = ?2",
        )?;
        let row = stmt
            .query_row(params![member_id, group_id], membership_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_memberships(&self, group_id: GroupId) -> Result<Vec<MembershipRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT member_id, group_id, joined_at, active, missed_scans
             FROM memberships WHERE group_id = ?1 ORDER BY member_id",
        )?;
        let rows = stmt.query_map(params![group_id], membership_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Groups in which the member currently has an active membership, only
    /// counting groups that are themselves monitored.
    pub fn active_groups_for_member(
        &self,
        member_id: MemberId,
    ) -> Result<Vec<GroupRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT g.group_id, g.title, g.active, g.registered_at,
                    g.access_failures, g.transient_failures
             FROM groups g
             JOIN memberships m ON m.group_id = g.group_id
             WHERE m.member_id = ?1 AND m.active = 1 AND g.active = 1
             ORDER BY g.group_id",
        )?;
        let rows = stmt.query_map(params![member_id], group_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Count one miss for every active membership of `group_id` whose member
    /// is not in `present`, deactivating those that reach `threshold`.
    /// Returns the members that were deactivated.
    pub fn record_misses(
        &self,
        group_id: GroupId,
        present: &HashSet<MemberId>,
        threshold: u32,
    ) -> Result<Vec<MemberId>, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let active: Vec<(MemberId, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT member_id, missed_scans FROM memberships
                 WHERE group_id = ?1 AND active = 1",
            )?;
            let rows = stmt.query_map(params![group_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u32))
            })?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            result
        };

        let mut deactivated = Vec::new();
        for (member_id, missed) in active {
            if present.contains(&member_id) {
                continue;
            }
            let missed = missed.saturating_add(1);
            let still_active = missed < threshold.max(1);
            tx.execute(
                "UPDATE memberships SET missed_scans = ?3, active = ?4
                 WHERE member_id = ?1 AND group_id = ?2",
                params![member_id, group_id, missed as i64, still_active as i32],
            )?;
            if !still_active {
                deactivated.push(member_id);
            }
        }
        tx.commit()?;
        Ok(deactivated)
    }

    pub fn deactivate_membership(
        &self,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE memberships SET active = 0
             WHERE member_id = ?1 AND group_id = ?2 AND active = 1",
            params![member_id, group_id],
        )?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    /// Insert a new group. Returns `false` if the id is already registered.
    pub fn insert_group(
        &self,
        group_id: GroupId,
        title: &str,
        now: u64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO groups (group_id, title, active, registered_at)
             VALUES (?1, ?2, 1, ?3)",
            params![group_id, title, now as i64],
        )?;
        Ok(affected > 0)
    }

    pub fn get_group(&self, group_id: GroupId) -> Result<Option<GroupRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, title, active, registered_at, access_failures, transient_failures
             FROM groups WHERE group_id = ?1",
        )?;
        let row = stmt
            .query_row(params![group_id], group_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_groups(&self, active_only: bool) -> Result<Vec<GroupRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, title, active, registered_at, access_failures, transient_failures
             FROM groups WHERE (?1 = 0 OR active = 1) ORDER BY registered_at, group_id",
        )?;
        let rows = stmt.query_map(params![active_only as i32], group_from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Flip the monitoring flag. Reactivation also clears failure streaks.
    pub fn set_group_active(&self, group_id: GroupId, active: bool) -> Result<bool, StorageError> {
        let affected = if active {
            self.conn.execute(
                "UPDATE groups SET active = 1, access_failures = 0, transient_failures = 0
                 WHERE group_id = ?1 AND active = 0",
                params![group_id],
            )?
        } else {
            self.conn.execute(
                "UPDATE groups SET active = 0 WHERE group_id = ?1 AND active = 1",
                params![group_id],
            )?
        };
        Ok(affected > 0)
    }

    pub fn set_group_title(&self, group_id: GroupId, title: &str) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE groups SET title = ?2 WHERE group_id = ?1 AND title != ?2",
            params![group_id, title],
        )?;
        Ok(affected > 0)
    }

    pub fn record_group_failure(
        &self,
        group_id: GroupId,
        kind: FailureKind,
    ) -> Result<FailureCounts, StorageError> {
        let column = match kind {
            FailureKind::AccessDenied => "access_failures",
            FailureKind::Transient => "transient_failures",
        };
        let affected = self.conn.execute(
            &format!("UPDATE groups SET {column} = {column} + 1 WHERE group_id = ?1"),
            params![group_id],
        )?;
        if affected == 0 {
            return Err(StorageError::NotFound(format!("group {group_id}")));
        }
        let counts = self.conn.query_row(
            "SELECT access_failures, transient_failures FROM groups WHERE group_id = ?1",
            params![group_id],
            |row| {
                Ok(FailureCounts {
                    access_failures: row.get::<_, i64>(0)? as u32,
                    transient_failures: row.get::<_, i64>(1)? as u32,
                })
            },
        )?;
        Ok(counts)
    }

    /// Reset failure streaks after a successful fetch. Returns the counts
    /// that were cleared.
    pub fn reset_group_failures(&self, group_id: GroupId) -> Result<FailureCounts, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let counts = tx
            .query_row(
                "SELECT access_failures, transient_failures FROM groups WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok(FailureCounts {
                        access_failures: row.get::<_, i64>(0)? as u32,
                        transient_failures: row.get::<_, i64>(1)? as u32,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("group {group_id}")))?;
        if counts.access_failures != 0 || counts.transient_failures != 0 {
            tx.execute(
                "UPDATE groups SET access_failures = 0, transient_failures = 0
                 WHERE group_id = ?1",
                params![group_id],
            )?;
        }
        tx.commit()?;
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    pub fn insert_outbox(&self, payload: &str, now: u64) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO outbox (payload, queued_at) VALUES (?1, ?2)",
            params![payload, now as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_outbox(&self, id: i64, payload: &str) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE outbox SET payload = ?2 WHERE id = ?1",
            params![id, payload],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_outbox(&self, id: i64) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn list_outbox(&self) -> Result<Vec<OutboxRow>, StorageError> {
        self.list_outbox_after(None, usize::MAX)
    }

    /// Up to `limit` outbox rows with an id above `after_id`, oldest first.
    pub fn list_outbox_after(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<OutboxRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, queued_at FROM outbox
             WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![after_id.unwrap_or(0), limit], |row| {
            Ok(OutboxRow {
                id: row.get(0)?,
                payload: row.get(1)?,
                queued_at: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn upsert_membership(
    conn: &Connection,
    member_id: MemberId,
    group_id: GroupId,
    now: u64,
) -> Result<usize, StorageError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO memberships (member_id, group_id, joined_at, active, missed_scans)
         VALUES (?1, ?2, ?3, 1, 0)",
        params![member_id, group_id, now as i64],
    )?;
    if inserted > 0 {
        return Ok(inserted);
    }
    let updated = conn.execute(
        "UPDATE memberships SET active = 1, missed_scans = 0
         WHERE member_id = ?1 AND group_id = ?2 AND (active = 0 OR missed_scans != 0)",
        params![member_id, group_id],
    )?;
    Ok(updated)
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        member_id: row.get(0)?,
        profile: Profile {
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            handle: row.get(3)?,
            phone: row.get(4)?,
        },
        first_seen: row.get::<_, i64>(5)? as u64,
        updated_at: row.get::<_, i64>(6)? as u64,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        group_id: row.get(0)?,
        title: row.get(1)?,
        active: row.get::<_, i32>(2)? != 0,
        registered_at: row.get::<_, i64>(3)? as u64,
        access_failures: row.get::<_, i64>(4)? as u32,
        transient_failures: row.get::<_, i64>(5)? as u32,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<MembershipRow> {
    Ok(MembershipRow {
        member_id: row.get(0)?,
        group_id: row.get(1)?,
        joined_at: row.get::<_, i64>(2)? as u64,
        active: row.get::<_, i32>(3)? != 0,
        missed_scans: row.get::<_, i64>(4)? as u32,
    })
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ChangeRecord, StorageError>> {
    let field: String = row.get(2)?;
    let group_ids: String = row.get(6)?;
    let id: i64 = row.get(0)?;
    let Some(field) = ProfileField::parse(&field) else {
        return Ok(Err(StorageError::Corrupt(format!(
            "name_changes row {id} has unknown field {field}"
        ))));
    };
    let group_ids = match serde_json::from_str(&group_ids) {
        Ok(ids) => ids,
        Err(e) => return Ok(Err(StorageError::Serde(e))),
    };
    Ok(Ok(ChangeRecord {
        id,
        member_id: row.get(1)?,
        field,
        old_value: row.get(3)?,
        new_value: row.get(4)?,
        detected_at: row.get::<_, i64>(5)? as u64,
        group_ids,
    }))
}

/// Current wall-clock time as unix seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolve the database path: `{data_dir}/namewatch.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("namewatch.db")
}

/// Resolve the namewatch home directory from environment or default.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var("NAMEWATCH_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_default().join(".namewatch"))
}

fn home_or_default() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn alice() -> Profile {
        Profile {
            first_name: Some("Alice".to_string()),
            last_name: Some("Smith".to_string()),
            handle: Some("alice".to_string()),
            phone: None,
        }
    }

    fn seeded() -> Storage {
        let storage = test_storage();
        storage.insert_group(-100, "Group A", 1).unwrap();
        storage.insert_group(-200, "Group B", 1).unwrap();
        assert!(storage
            .insert_member_with_memberships(1, &alice(), &[-100], 10)
            .unwrap());
        storage
    }

    #[test]
    fn test_schema_creation() {
        let storage = test_storage();
        assert_eq!(storage.count_members().unwrap(), 0);
        assert!(storage.list_groups(false).unwrap().is_empty());
        assert!(storage.list_outbox().unwrap().is_empty());
    }

    #[test]
    fn test_member_insert_is_first_observation_only() {
        let storage = seeded();
        let row = storage.get_member(1).unwrap().unwrap();
        assert_eq!(row.profile, alice());
        assert_eq!(row.first_seen, 10);

        // A second insert for the same id writes nothing.
        let mut other = alice();
        other.first_name = Some("Mallory".to_string());
        assert!(!storage
            .insert_member_with_memberships(1, &other, &[-200], 20)
            .unwrap());
        assert_eq!(storage.get_member(1).unwrap().unwrap().profile, alice());
        assert!(storage.get_membership(1, -200).unwrap().is_none());
    }

    #[test]
    fn test_apply_scan_result_updates_snapshot_and_history() {
        let storage = seeded();
        let mut next = alice();
        next.first_name = Some("Alicia".to_string());
        let changes = crate::profile::diff(&alice(), &next);

        let records = storage
            .apply_scan_result(1, &next, &changes, &[-100, -200], 30)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].group_ids, vec![-100, -200]);

        let row = storage.get_member(1).unwrap().unwrap();
        assert_eq!(row.profile.first_name.as_deref(), Some("Alicia"));
        assert_eq!(row.updated_at, 30);

        let history = storage.list_changes(1, None, 100).unwrap();
        assert_eq!(history, records);
        assert_eq!(history[0].old_value.as_deref(), Some("Alice"));
        assert_eq!(history[0].new_value.as_deref(), Some("Alicia"));
    }

    #[test]
    fn test_apply_scan_result_is_all_or_nothing() {
        let storage = seeded();
        storage
            .conn
            .execute_batch(
                "CREATE TEMP TRIGGER fail_last_name BEFORE INSERT ON name_changes
                 WHEN NEW.field = 'last_name'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let next = Profile {
            first_name: Some("Alicia".to_string()),
            last_name: Some("Jones".to_string()),
            handle: Some("alice".to_string()),
            phone: None,
        };
        let changes = crate::profile::diff(&alice(), &next);
        assert_eq!(changes.len(), 2);

        let result = storage.apply_scan_result(1, &next, &changes, &[-100], 30);
        assert!(result.is_err());

        let row = storage.get_member(1).unwrap().unwrap();
        assert_eq!(row.profile, alice());
        assert_eq!(row.updated_at, 10);
        assert!(storage.list_changes(1, None, 100).unwrap().is_empty());
    }

    #[test]
    fn test_apply_scan_result_unknown_member() {
        let storage = seeded();
        let err = storage
            .apply_scan_result(99, &alice(), &[], &[-100], 30)
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_history_paging_and_recent() {
        let storage = seeded();
        let mut current = alice();
        for i in 0..5 {
            let mut next = current.clone();
            next.first_name = Some(format!("Alice{i}"));
            let changes = crate::profile::diff(&current, &next);
            storage
                .apply_scan_result(1, &next, &changes, &[-100], 100 + i)
                .unwrap();
            current = next;
        }

        let first = storage.list_changes(1, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = storage.list_changes(1, Some(first[1].id), 2).unwrap();
        assert_eq!(second.len(), 2);
        assert!(second[0].id > first[1].id);
        let rest = storage.list_changes(1, Some(second[1].id), 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].new_value.as_deref(), Some("Alice4"));

        let recent = storage.recent_changes(1, 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].new_value.as_deref(), Some("Alice4"));
        assert!(recent[0].id > recent[1].id);
    }

    #[test]
    fn test_observe_memberships_is_idempotent() {
        let storage = seeded();
        assert_eq!(storage.observe_memberships(1, &[-100], 20).unwrap(), 0);
        assert_eq!(storage.observe_memberships(1, &[-200], 20).unwrap(), 1);
        assert_eq!(storage.observe_memberships(1, &[-100, -200], 30).unwrap(), 0);

        let membership = storage.get_membership(1, -200).unwrap().unwrap();
        assert_eq!(membership.joined_at, 20);
        assert!(membership.active);
    }

    #[test]
    fn test_record_misses_deactivates_at_threshold() {
        let storage = seeded();
        let absent = HashSet::new();
        assert!(storage.record_misses(-100, &absent, 3).unwrap().is_empty());
        assert!(storage.record_misses(-100, &absent, 3).unwrap().is_empty());
        assert_eq!(storage.record_misses(-100, &absent, 3).unwrap(), vec![1]);

        let membership = storage.get_membership(1, -100).unwrap().unwrap();
        assert!(!membership.active);
        assert_eq!(membership.missed_scans, 3);
        assert!(storage.active_groups_for_member(1).unwrap().is_empty());

        // Seen again: reactivated and miss count cleared.
        assert_eq!(storage.observe_memberships(1, &[-100], 50).unwrap(), 1);
        let membership = storage.get_membership(1, -100).unwrap().unwrap();
        assert!(membership.active);
        assert_eq!(membership.missed_scans, 0);
    }

    #[test]
    fn test_present_members_are_not_counted_as_missed() {
        let storage = seeded();
        let present: HashSet<MemberId> = [1].into_iter().collect();
        storage.record_misses(-100, &present, 1).unwrap();
        let membership = storage.get_membership(1, -100).unwrap().unwrap();
        assert!(membership.active);
        assert_eq!(membership.missed_scans, 0);
    }

    #[test]
    fn test_group_crud_and_soft_deactivation() {
        let storage = seeded();
        assert!(!storage.insert_group(-100, "Renamed", 5).unwrap());
        assert_eq!(storage.list_groups(true).unwrap().len(), 2);

        assert!(storage.set_group_active(-100, false).unwrap());
        assert!(!storage.set_group_active(-100, false).unwrap());
        assert_eq!(storage.list_groups(true).unwrap().len(), 1);
        assert_eq!(storage.list_groups(false).unwrap().len(), 2);
        assert!(storage.get_group(-100).unwrap().is_some());

        assert!(storage.set_group_title(-200, "Group B2").unwrap());
        assert_eq!(storage.get_group(-200).unwrap().unwrap().title, "Group B2");
    }

    #[test]
    fn test_group_failure_counters() {
        let storage = seeded();
        let counts = storage
            .record_group_failure(-100, FailureKind::AccessDenied)
            .unwrap();
        assert_eq!(counts.access_failures, 1);
        let counts = storage
            .record_group_failure(-100, FailureKind::Transient)
            .unwrap();
        assert_eq!(counts.transient_failures, 1);
        assert_eq!(counts.access_failures, 1);

        let cleared = storage.reset_group_failures(-100).unwrap();
        assert_eq!(cleared.access_failures, 1);
        let group = storage.get_group(-100).unwrap().unwrap();
        assert_eq!(group.access_failures, 0);
        assert_eq!(group.transient_failures, 0);

        assert!(matches!(
            storage.record_group_failure(-999, FailureKind::Transient),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_outbox_crud() {
        let storage = test_storage();
        let a = storage.insert_outbox("{\"a\":1}", 1).unwrap();
        let b = storage.insert_outbox("{\"b\":2}", 2).unwrap();
        assert!(storage.update_outbox(a, "{\"a\":3}").unwrap());

        let rows = storage.list_outbox().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload, "{\"a\":3}");

        assert!(storage.delete_outbox(b).unwrap());
        assert!(!storage.delete_outbox(b).unwrap());
        assert_eq!(storage.list_outbox().unwrap().len(), 1);
    }

    #[test]
    fn test_outbox_pages_after_id() {
        let storage = test_storage();
        let ids: Vec<i64> = (0..5)
            .map(|i| storage.insert_outbox(&format!("{{\"n\":{i}}}"), i).unwrap())
            .collect();

        let first = storage.list_outbox_after(None, 2).unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2].to_vec());
        let rest = storage.list_outbox_after(Some(ids[1]), 10).unwrap();
        assert_eq!(rest.iter().map(|r| r.id).collect::<Vec<_>>(), ids[2..].to_vec());
        assert!(storage.list_outbox_after(Some(ids[4]), 10).unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(dir.path());
        {
            let storage = Storage::open(&path).unwrap();
            storage.insert_group(-1, "Disk", 1).unwrap();
        }
        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.get_group(-1).unwrap().unwrap().title, "Disk");
    }
}
