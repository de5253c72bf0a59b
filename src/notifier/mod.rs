//! Flood-controlled delivery of admin notifications.
//!
//! Producers call [`Notifier::enqueue`]; a single dispatch loop
//! ([`Notifier::run`]) drains the queue through a token bucket. A rejected
//! send stays at the head of the queue with a `next_attempt_at` deadline and
//! is retried with capped exponential backoff for as long as the process
//! lives. Every queued notice is mirrored in the `outbox` table, so pending
//! retries survive a restart, and a full in-memory queue overflows into that
//! table instead of dropping anything.

pub mod bucket;
pub mod message;
pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::ChangeEvent;
use crate::platform::{MembershipClient, PlatformError};
use crate::storage::{now_secs, SharedStorage, Storage, StorageError};

use self::bucket::{Backoff, TokenBucket};
pub use self::message::{coalesce, Notice};
use self::queue::{OutboundQueue, QueuedNotice};

pub const DEFAULT_RATE_MESSAGES: u32 = 20;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Consecutive failed sends of one notice before the failure is logged as
/// an error rather than a warning.
pub const DEFAULT_SUSTAINED_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Chat that receives every notification.
    pub admin_id: i64,
    pub rate_messages: u32,
    pub rate_window: Duration,
    pub queue_capacity: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub sustained_failures: u32,
}

impl NotifierConfig {
    pub fn new(admin_id: i64) -> Self {
        Self {
            admin_id,
            rate_messages: DEFAULT_RATE_MESSAGES,
            rate_window: DEFAULT_RATE_WINDOW,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            sustained_failures: DEFAULT_SUSTAINED_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub queued: usize,
    pub delivered: u64,
    pub send_attempts: u64,
    /// Pending notices held only in the outbox until the queue drains.
    pub overflow: usize,
}

struct Shared {
    config: NotifierConfig,
    client: Arc<dyn MembershipClient>,
    storage: SharedStorage,
    queue: Mutex<OutboundQueue>,
    wake: Notify,
    delivered: AtomicU64,
    send_attempts: AtomicU64,
}

/// Cloneable handle; every clone feeds the same queue.
#[derive(Clone)]
pub struct Notifier {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("admin_id", &self.shared.config.admin_id)
            .finish_non_exhaustive()
    }
}

enum Step {
    Idle,
    WaitUntil(Instant),
    Send(Notice),
}

impl Notifier {
    /// Create the notifier and reload anything left in the outbox.
    pub async fn new(
        config: NotifierConfig,
        client: Arc<dyn MembershipClient>,
        storage: SharedStorage,
    ) -> Result<Self, StorageError> {
        let queue = {
            let guard = storage.lock().await;
            restore_queue(&guard, config.queue_capacity)?
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                storage,
                queue: Mutex::new(queue),
                wake: Notify::new(),
                delivered: AtomicU64::new(0),
                send_attempts: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.shared.config
    }

    /// Queue a notice, folding it into a pending notice for the same member
    /// when one is waiting.
    pub async fn enqueue(&self, mut notice: Notice) -> Result<(), StorageError> {
        let mut queue = self.shared.queue.lock().await;

        if let Some(index) = queue.merge_target(&notice) {
            if let Some(entry) = queue.get_mut(index) {
                let mut merged = entry.notice.clone();
                match merged.absorb(notice) {
                    Ok(()) => {
                        if let Some(id) = entry.outbox_id {
                            let payload = serde_json::to_string(&merged)?;
                            self.shared.storage.lock().await.update_outbox(id, &payload)?;
                        }
                        entry.notice = merged;
                        debug!(
                            kind = entry.notice.kind(),
                            "notifier: merged into pending notification"
                        );
                        drop(queue);
                        self.shared.wake.notify_one();
                        return Ok(());
                    }
                    Err(unmerged) => notice = unmerged,
                }
            }
        }

        let payload = serde_json::to_string(&notice)?;
        let kind = notice.kind();
        let id = self
            .shared
            .storage
            .lock()
            .await
            .insert_outbox(&payload, now_secs())?;
        if queue.room() > 0 {
            queue.push(QueuedNotice::new(notice, Some(id), Instant::now()));
            debug!(kind, queued = queue.len(), "notifier: queued");
        } else {
            queue.spill();
            warn!(
                kind,
                queued = queue.len(),
                overflow = queue.spilled(),
                "notifier: queue full, notification kept in outbox until the queue drains"
            );
        }
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Coalesce one scan's events per member and queue the result. Returns
    /// the number of notifications queued.
    pub async fn enqueue_events(&self, events: Vec<ChangeEvent>) -> Result<usize, StorageError> {
        let notices = coalesce(events);
        let count = notices.len();
        for notice in notices {
            self.enqueue(notice).await?;
        }
        Ok(count)
    }

    pub async fn queued(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub async fn stats(&self) -> NotifierStats {
        let queue = self.shared.queue.lock().await;
        NotifierStats {
            queued: queue.len(),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            send_attempts: self.shared.send_attempts.load(Ordering::Relaxed),
            overflow: queue.spilled(),
        }
    }

    /// Dispatch loop. Returns once `shutdown` is cancelled; a send already
    /// in progress is allowed to finish first. Undelivered notices stay in
    /// the outbox.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = &self.shared.config;
        let mut bucket = TokenBucket::new(config.rate_messages, config.rate_window, Instant::now());
        let backoff = Backoff {
            base: config.backoff_base,
            max: config.backoff_max,
        };
        info!(
            admin = config.admin_id,
            rate = config.rate_messages,
            window_secs = config.rate_window.as_secs(),
            "notifier: dispatch loop started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.next_step(&mut bucket).await {
                Step::Idle => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.shared.wake.notified() => {}
                    }
                }
                Step::WaitUntil(at) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.shared.wake.notified() => {}
                    }
                }
                Step::Send(notice) => {
                    self.shared.send_attempts.fetch_add(1, Ordering::Relaxed);
                    let result = self
                        .shared
                        .client
                        .send_message(config.admin_id, &notice.render())
                        .await;
                    self.complete(result, &backoff).await;
                }
            }
        }

        let pending = self.queued().await;
        info!(pending, "notifier: dispatch loop stopped, pending notices kept in outbox");
    }

    /// Inspect the head of the queue. When it is due and a token is
    /// available, mark it in flight and hand back a copy to send.
    async fn next_step(&self, bucket: &mut TokenBucket) -> Step {
        let mut queue = self.shared.queue.lock().await;
        let now = Instant::now();
        if queue.front().is_none() && queue.spilled() > 0 {
            let storage = self.shared.storage.lock().await;
            if let Err(e) = refill(&storage, &mut queue, None) {
                warn!(error = %e, "notifier: could not page in overflow");
                return Step::WaitUntil(Backoff::deadline(now, self.shared.config.backoff_max));
            }
        }
        let Some(head) = queue.front_mut() else {
            return Step::Idle;
        };
        if head.next_attempt_at > now {
            return Step::WaitUntil(head.next_attempt_at);
        }
        if let Err(wait) = bucket.try_acquire(now) {
            return Step::WaitUntil(Backoff::deadline(now, wait));
        }
        head.in_flight = true;
        Step::Send(head.notice.clone())
    }

    async fn complete(&self, result: Result<(), PlatformError>, backoff: &Backoff) {
        let mut queue = self.shared.queue.lock().await;
        match result {
            Ok(()) => {
                let Some(done) = queue.pop_front() else {
                    return;
                };
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                info!(
                    kind = done.notice.kind(),
                    retries = done.failures,
                    "notifier: delivered"
                );
                let storage = self.shared.storage.lock().await;
                if let Some(id) = done.outbox_id {
                    if let Err(e) = storage.delete_outbox(id) {
                        warn!(outbox_id = id, error = %e, "notifier: could not clear outbox row");
                    }
                }
                if queue.spilled() > 0 {
                    let after = queue.last_outbox_id().or(done.outbox_id);
                    if let Err(e) = refill(&storage, &mut queue, after) {
                        warn!(error = %e, "notifier: could not page in overflow, retrying after next delivery");
                    }
                }
            }
            Err(err) => {
                let Some(head) = queue.front_mut() else {
                    return;
                };
                head.in_flight = false;
                head.failures += 1;
                let delay = backoff.next_delay(head.failures, err.retry_after());
                head.next_attempt_at = Backoff::deadline(Instant::now(), delay);
                if head.failures == self.shared.config.sustained_failures {
                    error!(
                        kind = head.notice.kind(),
                        failures = head.failures,
                        error = %err,
                        "notifier: delivery keeps failing, still retrying"
                    );
                } else {
                    warn!(
                        kind = head.notice.kind(),
                        failures = head.failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "notifier: send failed"
                    );
                }
            }
        }
    }
}

/// Load pending outbox rows into memory up to capacity; the rest stay
/// spilled.
fn restore_queue(storage: &Storage, capacity: usize) -> Result<OutboundQueue, StorageError> {
    let now = Instant::now();
    let mut queue = OutboundQueue::new(capacity);
    for row in storage.list_outbox()? {
        if queue.room() == 0 {
            queue.spill();
            continue;
        }
        match serde_json::from_str::<Notice>(&row.payload) {
            Ok(notice) => queue.push(QueuedNotice::new(notice, Some(row.id), now)),
            Err(e) => {
                warn!(outbox_id = row.id, error = %e, "notifier: dropping unreadable outbox row");
                storage.delete_outbox(row.id)?;
            }
        }
    }
    if !queue.is_empty() {
        info!(
            pending = queue.len(),
            overflow = queue.spilled(),
            "notifier: restored pending notifications"
        );
    }
    Ok(queue)
}

/// Page spilled outbox rows after `after_id` back into free slots.
fn refill(
    storage: &Storage,
    queue: &mut OutboundQueue,
    after_id: Option<i64>,
) -> Result<(), StorageError> {
    let room = queue.refill_room();
    if room == 0 {
        return Ok(());
    }
    let rows = storage.list_outbox_after(after_id, room)?;
    if rows.len() < room {
        // Nothing else is out there; resync the count with the table.
        queue.unspill(queue.spilled());
    } else {
        queue.unspill(rows.len());
    }
    let now = Instant::now();
    for row in rows {
        match serde_json::from_str::<Notice>(&row.payload) {
            Ok(notice) => queue.push(QueuedNotice::new(notice, Some(row.id), now)),
            Err(e) => {
                warn!(outbox_id = row.id, error = %e, "notifier: dropping unreadable outbox row");
                storage.delete_outbox(row.id)?;
            }
        }
    }
    debug!(resident = queue.resident(), overflow = queue.spilled(), "notifier: paged in overflow");
    Ok(())
}
