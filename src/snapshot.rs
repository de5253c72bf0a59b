//! Profile snapshots and change history.
//!
//! [`ProfileSnapshotStore`] is the async handle the scanner and admin
//! surface use. Every write is one SQLite transaction, so a reader never sees
//! a new snapshot without the history rows that explain it.

use std::collections::HashSet;

use crate::profile::{FieldChange, GroupId, MemberId, Profile};
use crate::storage::{ChangeRecord, GroupRow, MemberRow, SharedStorage, StorageError};

/// Default number of history rows fetched per page.
pub const HISTORY_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug)]
pub struct ProfileSnapshotStore {
    storage: SharedStorage,
}

impl ProfileSnapshotStore {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub async fn get_snapshot(&self, member_id: MemberId) -> Result<Option<Profile>, StorageError> {
        Ok(self.get_member(member_id).await?.map(|row| row.profile))
    }

    pub async fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRow>, StorageError> {
        self.storage.lock().await.get_member(member_id)
    }

    pub async fn members_tracked(&self) -> Result<u64, StorageError> {
        self.storage.lock().await.count_members()
    }

    /// Store the baseline for a never-seen member. Returns `false` if the
    /// member was already known.
    pub async fn register_member(
        &self,
        member_id: MemberId,
        profile: &Profile,
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<bool, StorageError> {
        self.storage
            .lock()
            .await
            .insert_member_with_memberships(member_id, profile, group_ids, now)
    }

    /// Update the snapshot and append one [`ChangeRecord`] per change as a
    /// single transaction.
    pub async fn apply_scan_result(
        &self,
        member_id: MemberId,
        new_profile: &Profile,
        changes: &[FieldChange],
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        self.storage
            .lock()
            .await
            .apply_scan_result(member_id, new_profile, changes, group_ids, now)
    }

    pub async fn observe_memberships(
        &self,
        member_id: MemberId,
        group_ids: &[GroupId],
        now: u64,
    ) -> Result<usize, StorageError> {
        self.storage
            .lock()
            .await
            .observe_memberships(member_id, group_ids, now)
    }

    pub async fn record_misses(
        &self,
        group_id: GroupId,
        present: &HashSet<MemberId>,
        threshold: u32,
    ) -> Result<Vec<MemberId>, StorageError> {
        self.storage
            .lock()
            .await
            .record_misses(group_id, present, threshold)
    }

    pub async fn leave_group(
        &self,
        member_id: MemberId,
        group_id: GroupId,
    ) -> Result<bool, StorageError> {
        self.storage
            .lock()
            .await
            .deactivate_membership(member_id, group_id)
    }

    /// Monitored groups the member is currently an active member of.
    pub async fn active_groups(&self, member_id: MemberId) -> Result<Vec<GroupRow>, StorageError> {
        self.storage.lock().await.active_groups_for_member(member_id)
    }

    /// Lazy, oldest-first history for a member.
    pub fn history(&self, member_id: MemberId) -> HistoryCursor {
        self.history_after(member_id, None)
    }

    /// Resume a history walk after the record with id `after_id`.
    pub fn history_after(&self, member_id: MemberId, after_id: Option<i64>) -> HistoryCursor {
        HistoryCursor {
            store: self.clone(),
            member_id,
            after_id,
            page_size: HISTORY_PAGE_SIZE,
            exhausted: false,
        }
    }

    /// Full history, oldest first.
    pub async fn query_history(&self, member_id: MemberId) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut cursor = self.history(member_id);
        let mut all = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Latest `limit` records, newest first.
    pub async fn recent_history(
        &self,
        member_id: MemberId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        self.storage.lock().await.recent_changes(member_id, limit)
    }
}

/// Page-by-page walk over one member's history. Each page takes the storage
/// lock only for the duration of its query.
#[derive(Debug)]
pub struct HistoryCursor {
    store: ProfileSnapshotStore,
    member_id: MemberId,
    after_id: Option<i64>,
    page_size: usize,
    exhausted: bool,
}

impl HistoryCursor {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Id of the last record returned; pass to
    /// [`ProfileSnapshotStore::history_after`] to resume.
    pub fn position(&self) -> Option<i64> {
        self.after_id
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<ChangeRecord>>, StorageError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .store
            .storage
            .lock()
            .await
            .list_changes(self.member_id, self.after_id, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after_id = Some(last.id);
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}
