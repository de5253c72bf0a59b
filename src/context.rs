//! Explicit handle bundle passed to the scheduler, command router and admin
//! HTTP surface. There is no process-wide state besides this.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::GroupRef;
use crate::notifier::{Notice, Notifier, NotifierConfig};
use crate::platform::MembershipClient;
use crate::profile::{GroupId, MemberId};
use crate::registry::{GroupRegistry, RegisterOutcome, RegistryConfig};
use crate::scanner::{IngestOutcome, Observation, ScanReport, Scanner, ScannerConfig};
use crate::scheduler::{Scheduler, SchedulerState, TriggerError, TriggerSource};
use crate::snapshot::ProfileSnapshotStore;
use crate::storage::{ChangeRecord, GroupRow, SharedStorage, StorageError};

/// Tunables for every core component.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub scan_interval: Duration,
    pub scanner: ScannerConfig,
    pub notifier: NotifierConfig,
    pub registry: RegistryConfig,
}

impl WatchSettings {
    pub fn new(admin_id: i64) -> Self {
        Self {
            scan_interval: crate::scheduler::DEFAULT_SCAN_INTERVAL,
            scanner: ScannerConfig::default(),
            notifier: NotifierConfig::new(admin_id),
            registry: RegistryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_groups: Vec<GroupRow>,
    pub last_scan_time: Option<u64>,
    pub members_tracked: u64,
    pub state: SchedulerState,
    pub scan_interval_secs: u64,
    pub queued_notifications: usize,
}

#[derive(Clone, Debug)]
pub struct WatchContext {
    pub store: ProfileSnapshotStore,
    pub registry: GroupRegistry,
    pub notifier: Notifier,
    pub scanner: Arc<Scanner>,
    pub scheduler: Arc<Scheduler>,
    pub admin_id: i64,
    pub shutdown: CancellationToken,
}

impl WatchContext {
    /// Wire the core together. Pending notifications from a previous run
    /// are reloaded here.
    pub async fn build(
        storage: SharedStorage,
        client: Arc<dyn MembershipClient>,
        settings: WatchSettings,
        shutdown: CancellationToken,
    ) -> Result<Self, StorageError> {
        let admin_id = settings.notifier.admin_id;
        let store = ProfileSnapshotStore::new(storage.clone());
        let registry = GroupRegistry::new(storage.clone(), settings.registry);
        let notifier = Notifier::new(settings.notifier, client.clone(), storage).await?;
        let scanner = Arc::new(Scanner::new(
            client,
            store.clone(),
            registry.clone(),
            notifier.clone(),
            settings.scanner,
        ));
        let scheduler = Arc::new(Scheduler::new(
            scanner.clone(),
            settings.scan_interval,
            shutdown.clone(),
        ));
        Ok(Self {
            store,
            registry,
            notifier,
            scanner,
            scheduler,
            admin_id,
            shutdown,
        })
    }

    pub fn is_admin(&self, sender_id: i64) -> bool {
        sender_id == self.admin_id
    }

    pub async fn trigger_scan(&self) -> Result<ScanReport, TriggerError> {
        self.scheduler.trigger(TriggerSource::Manual).await
    }

    pub async fn register_group(
        &self,
        group_id: GroupId,
        title: &str,
    ) -> Result<RegisterOutcome, StorageError> {
        self.registry.register(group_id, title).await
    }

    pub async fn deactivate_group(&self, group_id: GroupId) -> Result<bool, StorageError> {
        self.registry.deactivate(group_id).await
    }

    /// Register a group and load its members as a baseline. The outcome of
    /// the scan is `AlreadyScanning` when another scan holds the guard; the
    /// group is then picked up by that scan or the next one.
    pub async fn start_group(
        &self,
        group_id: GroupId,
        title: &str,
    ) -> Result<(RegisterOutcome, Result<ScanReport, TriggerError>), StorageError> {
        let outcome = self.register_group(group_id, title).await?;
        let scan = self.scheduler.trigger(TriggerSource::Registration).await;
        Ok((outcome, scan))
    }

    pub async fn get_status(&self) -> Result<StatusReport, StorageError> {
        Ok(StatusReport {
            active_groups: self.registry.active_groups().await?,
            last_scan_time: self.scheduler.last_scan_time(),
            members_tracked: self.store.members_tracked().await?,
            state: self.scheduler.state(),
            scan_interval_secs: self.scheduler.interval().as_secs(),
            queued_notifications: self.notifier.queued().await,
        })
    }

    /// Latest `limit` change records for a member, newest first.
    pub async fn recent_history(
        &self,
        member_id: MemberId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        self.store.recent_history(member_id, limit).await
    }

    pub async fn ingest(&self, observation: Observation) -> Result<IngestOutcome, StorageError> {
        self.scanner.ingest(observation).await
    }

    /// Queue the one-off startup notice.
    pub async fn announce_startup(&self) {
        let notice = async {
            let groups = self.registry.active_groups().await?;
            Ok::<_, StorageError>(Notice::Startup {
                members_tracked: self.store.members_tracked().await?,
                groups: groups.iter().map(GroupRef::from).collect(),
            })
        };
        let result = match notice.await {
            Ok(notice) => self.notifier.enqueue(notice).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "context: could not queue startup notice");
        }
    }
}
