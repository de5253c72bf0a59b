//! Shared fixtures: a scripted in-memory platform and context builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use namewatch::context::{WatchContext, WatchSettings};
use namewatch::platform::{MembershipClient, PlatformError};
use namewatch::profile::{GroupId, MemberProfile, Profile};
use namewatch::storage::{SharedStorage, Storage};

pub const ADMIN_ID: i64 = 4242;

/// Blocks every fetch until released, so a scan can be held open.
pub struct FetchGate {
    pub entered: Notify,
    pub release: Semaphore,
}

impl FetchGate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    pub fn open(&self) {
        self.release.add_permits(1_000);
    }
}

#[derive(Default)]
pub struct FakeClient {
    members: Mutex<HashMap<GroupId, Result<Vec<MemberProfile>, PlatformError>>>,
    fetch_log: Mutex<Vec<GroupId>>,
    gate: Mutex<Option<Arc<FetchGate>>>,
    send_failures: Mutex<VecDeque<PlatformError>>,
    send_attempts: AtomicUsize,
    sent: Mutex<Vec<(i64, String)>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_members(&self, group_id: GroupId, members: Vec<MemberProfile>) {
        self.members.lock().unwrap().insert(group_id, Ok(members));
    }

    pub fn fail_group(&self, group_id: GroupId, error: PlatformError) {
        self.members.lock().unwrap().insert(group_id, Err(error));
    }

    pub fn fail_sends(&self, errors: impl IntoIterator<Item = PlatformError>) {
        self.send_failures.lock().unwrap().extend(errors);
    }

    /// Hold every subsequent fetch until the returned gate is opened.
    pub fn hold_fetches(&self) -> Arc<FetchGate> {
        let gate = Arc::new(FetchGate::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fetches_of(&self, group_id: GroupId) -> usize {
        self.fetch_log
            .lock()
            .unwrap()
            .iter()
            .filter(|g| **g == group_id)
            .count()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipClient for FakeClient {
    async fn fetch_members(&self, group_id: GroupId) -> Result<Vec<MemberProfile>, PlatformError> {
        self.fetch_log.lock().unwrap().push(group_id);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }
        self.members
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_else(|| Err(PlatformError::AccessDenied("chat not found".into())))
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), PlatformError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

pub fn person(member_id: i64, first: &str, handle: Option<&str>) -> MemberProfile {
    MemberProfile::new(
        member_id,
        Profile {
            first_name: Some(first.to_string()),
            handle: handle.map(str::to_string),
            ..Profile::default()
        },
    )
}

pub fn settings() -> WatchSettings {
    let mut settings = WatchSettings::new(ADMIN_ID);
    settings.scanner.backoff_base = Duration::from_millis(5);
    settings.scanner.backoff_max = Duration::from_millis(20);
    settings.notifier.backoff_base = Duration::from_millis(10);
    settings.notifier.backoff_max = Duration::from_millis(100);
    settings
}

pub async fn context_with(storage: SharedStorage, client: Arc<FakeClient>) -> WatchContext {
    WatchContext::build(storage, client, settings(), CancellationToken::new())
        .await
        .expect("build context")
}

pub async fn context(client: Arc<FakeClient>) -> WatchContext {
    let storage = Storage::open_in_memory().expect("open storage").into_shared();
    context_with(storage, client).await
}

/// Run the dispatch loop until the queue is empty, then stop it.
pub async fn drain_notifications(ctx: &WatchContext) {
    let stop = CancellationToken::new();
    let task = tokio::spawn(ctx.notifier.clone().run(stop.clone()));
    tokio::time::timeout(Duration::from_secs(30), async {
        while ctx.notifier.queued().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notifications were not drained");
    stop.cancel();
    task.await.expect("notifier task");
}
