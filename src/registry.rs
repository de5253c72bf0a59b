//! Durable registry of monitored groups.
//!
//! Registration is idempotent and deactivation is a soft flag flip, so change
//! history stays attributable to the groups it was observed in. The registry
//! also keeps per-group failure streaks and decides when a failing group is
//! dropped from polling.

use tracing::{info, warn};

use crate::logging;
use crate::profile::GroupId;
use crate::storage::{now_secs, FailureKind, GroupRow, SharedStorage, StorageError};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive failed scans before a group is deactivated (AccessDenied)
    /// or reported unreachable (transient errors).
    pub failure_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyActive,
    Reactivated,
}

/// What the registry did with a reported fetch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Streak grew but no threshold was crossed on this failure.
    Counted { streak: u32 },
    /// AccessDenied streak reached the threshold; the group is no longer
    /// polled.
    Deactivated { group: GroupRow },
    /// Transient streak just reached the threshold. Reported once per streak.
    Unreachable { group: GroupRow, streak: u32 },
}

#[derive(Clone, Debug)]
pub struct GroupRegistry {
    storage: SharedStorage,
    config: RegistryConfig,
}

impl GroupRegistry {
    pub fn new(storage: SharedStorage, config: RegistryConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn register(
        &self,
        group_id: GroupId,
        title: &str,
    ) -> Result<RegisterOutcome, StorageError> {
        let title = match title.trim() {
            "" => format!("Group {group_id}"),
            trimmed => trimmed.to_string(),
        };
        let storage = self.storage.lock().await;
        if storage.insert_group(group_id, &title, now_secs())? {
            info!(group = %logging::group(group_id), %title, "registry: group registered");
            return Ok(RegisterOutcome::Registered);
        }
        if storage.set_group_active(group_id, true)? {
            storage.set_group_title(group_id, &title)?;
            info!(group = %logging::group(group_id), %title, "registry: group reactivated");
            return Ok(RegisterOutcome::Reactivated);
        }
        Ok(RegisterOutcome::AlreadyActive)
    }

    /// Stop polling a group. Returns `false` if it was not active.
    pub async fn deactivate(&self, group_id: GroupId) -> Result<bool, StorageError> {
        let changed = self.storage.lock().await.set_group_active(group_id, false)?;
        if changed {
            info!(group = %logging::group(group_id), "registry: group deactivated");
        }
        Ok(changed)
    }

    pub async fn active_groups(&self) -> Result<Vec<GroupRow>, StorageError> {
        self.storage.lock().await.list_groups(true)
    }

    pub async fn all_groups(&self) -> Result<Vec<GroupRow>, StorageError> {
        self.storage.lock().await.list_groups(false)
    }

    pub async fn get(&self, group_id: GroupId) -> Result<Option<GroupRow>, StorageError> {
        self.storage.lock().await.get_group(group_id)
    }

    pub async fn record_failure(
        &self,
        group_id: GroupId,
        kind: FailureKind,
    ) -> Result<FailureVerdict, StorageError> {
        let threshold = self.config.failure_threshold.max(1);
        let storage = self.storage.lock().await;
        let counts = storage.record_group_failure(group_id, kind)?;
        match kind {
            FailureKind::AccessDenied => {
                let streak = counts.access_failures;
                if streak >= threshold && storage.set_group_active(group_id, false)? {
                    let group = storage
                        .get_group(group_id)?
                        .ok_or_else(|| StorageError::NotFound(format!("group {group_id}")))?;
                    warn!(
                        group = %logging::group(group_id),
                        streak,
                        "registry: access denied too often, group deactivated"
                    );
                    return Ok(FailureVerdict::Deactivated { group });
                }
                Ok(FailureVerdict::Counted { streak })
            }
            FailureKind::Transient => {
                let streak = counts.transient_failures;
                if streak == threshold {
                    let group = storage
                        .get_group(group_id)?
                        .ok_or_else(|| StorageError::NotFound(format!("group {group_id}")))?;
                    warn!(
                        group = %logging::group(group_id),
                        streak,
                        "registry: group unreachable for consecutive scans"
                    );
                    return Ok(FailureVerdict::Unreachable { group, streak });
                }
                Ok(FailureVerdict::Counted { streak })
            }
        }
    }

    /// Clear failure streaks after a successful fetch.
    pub async fn record_success(&self, group_id: GroupId) -> Result<(), StorageError> {
        let cleared = self.storage.lock().await.reset_group_failures(group_id)?;
        if cleared.transient_failures >= self.config.failure_threshold.max(1) {
            info!(group = %logging::group(group_id), "registry: group reachable again");
        }
        Ok(())
    }
}
