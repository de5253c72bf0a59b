//! Timer and manual scan triggers behind a single-flight guard.
//!
//! A trigger that arrives while a scan is running is rejected with
//! [`TriggerError::AlreadyScanning`], never queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::scanner::{ScanReport, Scanner};
use crate::storage::StorageError;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Timer,
    Manual,
    Registration,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TriggerSource::Timer => "timer",
            TriggerSource::Manual => "manual",
            TriggerSource::Registration => "registration",
        })
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("scan already in progress")]
    AlreadyScanning,
    #[error("shutting down")]
    ShuttingDown,
    #[error("scan failed: {0}")]
    Storage(#[from] StorageError),
}

/// Held for the duration of one scan; clears the flag on drop, including
/// when the scan future is dropped mid-way.
struct ScanPermit<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ScanPermit<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ScanPermit<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Scheduler {
    scanner: Arc<Scanner>,
    interval: Duration,
    scanning: AtomicBool,
    /// Unix seconds of the last finished scan, 0 when none yet.
    last_scan: AtomicU64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(scanner: Arc<Scanner>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            scanner,
            interval: interval.max(Duration::from_secs(1)),
            scanning: AtomicBool::new(false),
            last_scan: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.scanning.load(Ordering::Acquire) {
            SchedulerState::Scanning
        } else {
            SchedulerState::Idle
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_scan_time(&self) -> Option<u64> {
        match self.last_scan.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    /// Run one scan now unless one is already running.
    pub async fn trigger(&self, source: TriggerSource) -> Result<ScanReport, TriggerError> {
        if self.shutdown.is_cancelled() {
            return Err(TriggerError::ShuttingDown);
        }
        let Some(_permit) = ScanPermit::try_acquire(&self.scanning) else {
            debug!(%source, "scheduler: scan already in progress");
            return Err(TriggerError::AlreadyScanning);
        };
        info!(%source, "scheduler: scan triggered");
        let report = self.scanner.run_scan(&self.shutdown).await?;
        self.last_scan.store(report.finished_at, Ordering::Relaxed);
        Ok(report)
    }

    /// Timer loop; the first tick fires immediately. Returns on shutdown
    /// after any in-flight scan has finished.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "scheduler: started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.trigger(TriggerSource::Timer).await {
                        Ok(_) | Err(TriggerError::AlreadyScanning) => {}
                        Err(TriggerError::ShuttingDown) => break,
                        Err(TriggerError::Storage(e)) => {
                            error!(error = %e, "scheduler: scan could not start");
                        }
                    }
                }
            }
        }
        info!("scheduler: stopped");
    }
}
