//! One reconciliation cycle: fetch every active group, diff each member
//! against its snapshot, persist, and hand the resulting events to the
//! notifier.
//!
//! Failures are contained where they happen. A group that cannot be fetched
//! becomes a [`GroupError`] and the other groups carry on; a member whose
//! update fails in storage becomes a [`MemberError`] and is retried on the
//! next cycle. Pushed observations ([`Scanner::ingest`]) go through the same
//! per-member update path as polled ones.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{ChangeEvent, GroupError, GroupRef, MemberError};
use crate::logging;
use crate::notifier::bucket::Backoff;
use crate::notifier::{Notice, Notifier};
use crate::platform::{MembershipClient, PlatformError};
use crate::profile::{diff, FieldChange, GroupId, MemberId, MemberProfile, Profile};
use crate::registry::{FailureVerdict, GroupRegistry};
use crate::snapshot::ProfileSnapshotStore;
use crate::storage::{now_secs, FailureKind, GroupRow, StorageError};

pub const DEFAULT_MISS_THRESHOLD: u32 = 3;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Consecutive scans a member may be missing from a group before the
    /// membership is marked inactive.
    pub miss_threshold: u32,
    /// Groups fetched concurrently.
    pub fetch_concurrency: usize,
    /// Fetch attempts per group per scan for transient errors.
    pub fetch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            miss_threshold: DEFAULT_MISS_THRESHOLD,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub started_at: u64,
    pub finished_at: u64,
    pub groups_scanned: usize,
    pub events: Vec<ChangeEvent>,
    pub errors: Vec<GroupError>,
    pub member_errors: Vec<MemberError>,
    pub new_members: usize,
    /// Memberships marked inactive after too many misses.
    pub departed: usize,
    pub notifications_queued: usize,
    /// Shutdown was requested; groups not yet fetched were skipped.
    pub cancelled: bool,
}

/// A member observation pushed by the platform instead of polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Seen {
        group_id: GroupId,
        member: MemberProfile,
    },
    Left {
        group_id: GroupId,
        member_id: MemberId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Group unknown or not monitored.
    Ignored,
    /// First sighting; baseline stored.
    Registered,
    Unchanged,
    Changed(ChangeEvent),
    Left { remaining: Vec<GroupRef> },
    /// The member was not an active member of that group.
    NotAMember,
}

enum MemberUpdate {
    Registered,
    Unchanged,
    Changed(Vec<FieldChange>),
}

/// Per-member write serialization: a scan and a pushed observation for the
/// same member never interleave their read-diff-apply sequences.
#[derive(Debug, Default)]
struct MemberLocks {
    inner: Mutex<HashMap<MemberId, Arc<Mutex<()>>>>,
}

impl MemberLocks {
    async fn acquire(&self, member_id: MemberId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(member_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct Scanner {
    client: Arc<dyn MembershipClient>,
    store: ProfileSnapshotStore,
    registry: GroupRegistry,
    notifier: Notifier,
    config: ScannerConfig,
    locks: MemberLocks,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub fn new(
        client: Arc<dyn MembershipClient>,
        store: ProfileSnapshotStore,
        registry: GroupRegistry,
        notifier: Notifier,
        config: ScannerConfig,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            notifier,
            config,
            locks: MemberLocks::default(),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Run one full cycle across all active groups. Only failing to list
    /// the groups themselves is returned as an error.
    pub async fn run_scan(&self, shutdown: &CancellationToken) -> Result<ScanReport, StorageError> {
        let started = tokio::time::Instant::now();
        let mut report = ScanReport {
            started_at: now_secs(),
            ..ScanReport::default()
        };
        let groups = self.registry.active_groups().await?;
        info!(groups = groups.len(), "scan: started");

        let fetched: Vec<(GroupRow, Option<Result<Vec<MemberProfile>, PlatformError>>)> =
            stream::iter(groups)
                .map(|group| async move {
                    let result = self.fetch_with_retry(group.group_id, shutdown).await;
                    (group, result)
                })
                .buffer_unordered(self.config.fetch_concurrency.max(1))
                .collect()
                .await;

        // Aggregate per member so one member seen in several groups is
        // diffed once and yields one event.
        let mut observed: BTreeMap<MemberId, (Profile, Vec<GroupRef>)> = BTreeMap::new();
        let mut succeeded: Vec<(GroupRow, HashSet<MemberId>)> = Vec::new();
        let mut failed: Vec<(GroupRow, PlatformError)> = Vec::new();
        for (group, outcome) in fetched {
            match outcome {
                None => report.cancelled = true,
                Some(Ok(members)) => {
                    report.groups_scanned += 1;
                    let mut present = HashSet::with_capacity(members.len());
                    for member in members {
                        present.insert(member.member_id);
                        let entry = observed
                            .entry(member.member_id)
                            .or_insert_with(|| (member.profile.clone(), Vec::new()));
                        entry.0 = member.profile;
                        entry.1.push(GroupRef::from(&group));
                    }
                    succeeded.push((group, present));
                }
                Some(Err(err)) => failed.push((group, err)),
            }
        }

        let now = now_secs();
        for (member_id, (profile, mut groups)) in observed {
            groups.sort();
            let member = MemberProfile::new(member_id, profile);
            match self.update_member(&member, &groups, now).await {
                Ok(MemberUpdate::Registered) => report.new_members += 1,
                Ok(MemberUpdate::Unchanged) => {}
                Ok(MemberUpdate::Changed(changes)) => report.events.push(ChangeEvent {
                    member_id,
                    profile: member.profile,
                    changes,
                    groups,
                    detected_at: now,
                }),
                Err(e) => {
                    warn!(member = %logging::member(member_id), error = %e, "scan: member update failed, retrying next cycle");
                    report.member_errors.push(MemberError {
                        member_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        for (group, present) in succeeded {
            match self
                .store
                .record_misses(group.group_id, &present, self.config.miss_threshold)
                .await
            {
                Ok(departed) => {
                    for member_id in &departed {
                        info!(
                            member = %logging::member(*member_id),
                            group = %logging::group(group.group_id),
                            "scan: member no longer in group"
                        );
                    }
                    report.departed += departed.len();
                }
                Err(e) => {
                    warn!(group = %logging::group(group.group_id), error = %e, "scan: could not record misses")
                }
            }
            if let Err(e) = self.registry.record_success(group.group_id).await {
                warn!(group = %logging::group(group.group_id), error = %e, "scan: could not reset failure streak");
            }
        }

        for (group, err) in failed {
            self.handle_fetch_failure(&group, &err).await;
            report.errors.push(GroupError {
                group: GroupRef::from(&group),
                error: err,
            });
        }

        if !report.events.is_empty() {
            match self.notifier.enqueue_events(report.events.clone()).await {
                Ok(queued) => report.notifications_queued = queued,
                Err(e) => error!(error = %e, "scan: could not queue notifications"),
            }
        }

        report.finished_at = now_secs();
        info!(
            groups = report.groups_scanned,
            events = report.events.len(),
            new_members = report.new_members,
            errors = report.errors.len() + report.member_errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            cancelled = report.cancelled,
            "scan: finished"
        );
        Ok(report)
    }

    /// Route a pushed observation through the same per-member path a scan
    /// uses. Pushed sightings never touch miss counters of other members.
    pub async fn ingest(&self, observation: Observation) -> Result<IngestOutcome, StorageError> {
        match observation {
            Observation::Seen { group_id, member } => {
                let Some(group) = self.registry.get(group_id).await?.filter(|g| g.active) else {
                    debug!(group = %logging::group(group_id), "ingest: group not monitored");
                    return Ok(IngestOutcome::Ignored);
                };
                let member = MemberProfile::new(member.member_id, member.profile);
                let now = now_secs();
                let seen_in = [GroupRef::from(&group)];
                match self.update_member(&member, &seen_in, now).await? {
                    MemberUpdate::Registered => Ok(IngestOutcome::Registered),
                    MemberUpdate::Unchanged => Ok(IngestOutcome::Unchanged),
                    MemberUpdate::Changed(changes) => {
                        let mut groups: Vec<GroupRef> = self
                            .store
                            .active_groups(member.member_id)
                            .await?
                            .iter()
                            .map(GroupRef::from)
                            .collect();
                        if groups.is_empty() {
                            groups = seen_in.to_vec();
                        }
                        let event = ChangeEvent {
                            member_id: member.member_id,
                            profile: member.profile,
                            changes,
                            groups,
                            detected_at: now,
                        };
                        self.notifier.enqueue_events(vec![event.clone()]).await?;
                        Ok(IngestOutcome::Changed(event))
                    }
                }
            }
            Observation::Left {
                group_id,
                member_id,
            } => {
                let Some(group) = self.registry.get(group_id).await? else {
                    return Ok(IngestOutcome::Ignored);
                };
                let _guard = self.locks.acquire(member_id).await;
                if !self.store.leave_group(member_id, group_id).await? {
                    return Ok(IngestOutcome::NotAMember);
                }
                let remaining: Vec<GroupRef> = self
                    .store
                    .active_groups(member_id)
                    .await?
                    .iter()
                    .map(GroupRef::from)
                    .collect();
                let name = self
                    .store
                    .get_snapshot(member_id)
                    .await?
                    .map(|p| p.display_name())
                    .unwrap_or_else(|| "(unknown)".to_string());
                info!(
                    member = %logging::member(member_id),
                    group = %logging::group(group_id),
                    remaining = remaining.len(),
                    "ingest: member left"
                );
                self.notifier
                    .enqueue(Notice::MemberLeft {
                        member_id,
                        name,
                        group: GroupRef::from(&group),
                        remaining: remaining.clone(),
                    })
                    .await?;
                Ok(IngestOutcome::Left { remaining })
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        group_id: GroupId,
        shutdown: &CancellationToken,
    ) -> Option<Result<Vec<MemberProfile>, PlatformError>> {
        let backoff = Backoff {
            base: self.config.backoff_base,
            max: self.config.backoff_max,
        };
        let attempts = self.config.fetch_attempts.max(1);
        let mut attempt = 0;
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            attempt += 1;
            match self.client.fetch_members(group_id).await {
                Ok(members) => {
                    debug!(group = %logging::group(group_id), members = members.len(), "scan: fetched");
                    return Some(Ok(members));
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = backoff.next_delay(attempt, err.retry_after());
                    debug!(
                        group = %logging::group(group_id),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "scan: fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    async fn handle_fetch_failure(&self, group: &GroupRow, err: &PlatformError) {
        let kind = if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::AccessDenied
        };
        warn!(group = %logging::group(group.group_id), error = %err, "scan: group fetch failed");
        let notice = match self.registry.record_failure(group.group_id, kind).await {
            Ok(FailureVerdict::Counted { .. }) => None,
            Ok(FailureVerdict::Deactivated { group }) => Some(Notice::GroupDeactivated {
                group: GroupRef::from(&group),
                reason: err.to_string(),
            }),
            Ok(FailureVerdict::Unreachable { group, .. }) => Some(Notice::GroupUnreachable {
                group: GroupRef::from(&group),
                reason: err.to_string(),
            }),
            Err(e) => {
                warn!(group = %logging::group(group.group_id), error = %e, "scan: could not record group failure");
                None
            }
        };
        if let Some(notice) = notice {
            if let Err(e) = self.notifier.enqueue(notice).await {
                error!(error = %e, "scan: could not queue admin notice");
            }
        }
    }

    /// Read-diff-apply for one member under its write lock.
    async fn update_member(
        &self,
        member: &MemberProfile,
        groups: &[GroupRef],
        now: u64,
    ) -> Result<MemberUpdate, StorageError> {
        let _guard = self.locks.acquire(member.member_id).await;
        let group_ids: Vec<GroupId> = groups.iter().map(|g| g.group_id).collect();

        let Some(snapshot) = self.store.get_snapshot(member.member_id).await? else {
            self.store
                .register_member(member.member_id, &member.profile, &group_ids, now)
                .await?;
            info!(
                member = %logging::member(member.member_id),
                groups = group_ids.len(),
                "scan: new member"
            );
            return Ok(MemberUpdate::Registered);
        };

        self.store
            .observe_memberships(member.member_id, &group_ids, now)
            .await?;
        let changes = diff(&snapshot, &member.profile);
        if changes.is_empty() {
            return Ok(MemberUpdate::Unchanged);
        }
        self.store
            .apply_scan_result(member.member_id, &member.profile, &changes, &group_ids, now)
            .await?;
        for change in &changes {
            info!(
                member = %logging::member(member.member_id),
                field = %change.field,
                old = change.old.as_deref().unwrap_or(""),
                new = change.new.as_deref().unwrap_or(""),
                "scan: profile changed"
            );
        }
        Ok(MemberUpdate::Changed(changes))
    }
}
