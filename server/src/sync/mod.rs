//! Inventory sync engine.
//!
//! One long-running loop wakes every 60 seconds and evaluates six scheduled
//! tasks with differentiated cadences: VM full/quick sync, template
//! full/verify, ISO full/verify. Iteration failures back off exponentially;
//! known-offline nodes do not count as failures. A control channel allows
//! mutating API paths to trigger one immediate full sync; triggers arriving
//! while a sync runs are absorbed.

use std::pin::pin;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use anyhow::Error;
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::db::Database;
use crate::error::is_expected_offline_error;
use crate::task_utils;

pub mod iso_sync;
pub mod template_sync;
pub mod vm_sync;

/// Wakeup interval of the scheduler loop.
const LOOP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum backoff after consecutive failures.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

const VM_FULL_SYNC_INTERVAL: i64 = 600;
const VM_QUICK_SYNC_INTERVAL: i64 = 120;
const TEMPLATE_FULL_SYNC_INTERVAL: i64 = 1800;
const TEMPLATE_VERIFY_INTERVAL: i64 = 300;
const ISO_FULL_SYNC_INTERVAL: i64 = 1800;
const ISO_VERIFY_INTERVAL: i64 = 300;

/// Control messages for the sync task.
pub enum ControlMsg {
    /// Run one full sync as soon as possible.
    TriggerFullSync,
}

static CONTROL_TX: OnceLock<Sender<ControlMsg>> = OnceLock::new();
static STATS: OnceLock<Arc<StdMutex<SyncStats>>> = OnceLock::new();

/// Counters exposed via the API for dashboards.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncStats {
    pub last_full_sync: Option<i64>,
    pub last_quick_sync: Option<i64>,
    pub full_sync_count: u64,
    pub quick_sync_count: u64,
    pub vms_synced: usize,
    pub sync_duration_secs: f64,

    pub last_template_full_sync: Option<i64>,
    pub last_template_verify: Option<i64>,
    pub template_full_sync_count: u64,
    pub templates_synced: usize,

    pub last_iso_full_sync: Option<i64>,
    pub last_iso_verify: Option<i64>,
    pub iso_full_sync_count: u64,
    pub isos_synced: usize,

    pub last_error: Option<String>,
    pub error_count: u32,
}

/// Current sync statistics.
pub fn stats() -> SyncStats {
    match STATS.get() {
        Some(stats) => stats.lock().unwrap().clone(),
        None => SyncStats::default(),
    }
}

/// Submit one immediate full-sync iteration.
///
/// Idempotent: while a sync is running (or a trigger is already queued),
/// further calls are absorbed and result in at most one extra iteration.
pub fn trigger_immediate_sync() {
    if let Some(tx) = CONTROL_TX.get() {
        match tx.try_send(ControlMsg::TriggerFullSync) {
            Ok(()) => log::debug!("immediate sync triggered"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("immediate sync already queued, absorbing trigger")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("sync task control channel closed")
            }
        }
    }
}

/// Start the sync task. Called once at daemon startup.
pub fn start_task(db: Database) {
    // capacity 1 makes the trigger naturally coalescing
    let (tx, rx) = mpsc::channel(1);
    if CONTROL_TX.set(tx).is_err() {
        panic!("sync task already started");
    }
    let stats = Arc::new(StdMutex::new(SyncStats::default()));
    STATS.set(Arc::clone(&stats)).ok();

    tokio::spawn(async move {
        let task = pin!(SyncTask::new(db, rx, stats).run());
        let abort_future = pin!(proxmox_daemon::shutdown_future());
        futures::future::select(task, abort_future).await;
    });
}

struct SyncTask {
    db: Database,
    control_rx: Receiver<ControlMsg>,
    stats: Arc<StdMutex<SyncStats>>,
    error_count: u32,
}

impl SyncTask {
    fn new(db: Database, control_rx: Receiver<ControlMsg>, stats: Arc<StdMutex<SyncStats>>) -> Self {
        Self {
            db,
            control_rx,
            stats,
            error_count: 0,
        }
    }

    async fn run(mut self) {
        log::info!("inventory sync engine starting up");

        loop {
            let delay = if self.error_count > 0 {
                let backoff = Duration::from_secs(2u64.saturating_pow(self.error_count));
                backoff.min(MAX_BACKOFF)
            } else {
                LOOP_INTERVAL
            };

            let wakeup = task_utils::next_aligned_instant(delay.as_secs());

            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wakeup)) => {
                    self.tick().await;
                }
                Some(ControlMsg::TriggerFullSync) = self.control_rx.recv() => {
                    log::info!("running full sync - triggered by control message");
                    self.run_task(Task::VmFull).await;
                }
            }
        }
    }

    /// Evaluate which tasks are due and run them.
    async fn tick(&mut self) {
        let now = proxmox_time::epoch_i64();
        let snapshot = self.stats.lock().unwrap().clone();

        let due = |last: Option<i64>, interval: i64| match last {
            Some(last) => now - last >= interval,
            None => true,
        };

        if due(snapshot.last_full_sync, VM_FULL_SYNC_INTERVAL) {
            self.run_task(Task::VmFull).await;
        } else if due(snapshot.last_quick_sync, VM_QUICK_SYNC_INTERVAL) {
            self.run_task(Task::VmQuick).await;
        }

        if due(snapshot.last_template_full_sync, TEMPLATE_FULL_SYNC_INTERVAL) {
            self.run_task(Task::TemplateFull).await;
        } else if due(snapshot.last_template_verify, TEMPLATE_VERIFY_INTERVAL) {
            self.run_task(Task::TemplateVerify).await;
        }

        if due(snapshot.last_iso_full_sync, ISO_FULL_SYNC_INTERVAL) {
            self.run_task(Task::IsoFull).await;
        } else if due(snapshot.last_iso_verify, ISO_VERIFY_INTERVAL) {
            self.run_task(Task::IsoVerify).await;
        }
    }

    async fn run_task(&mut self, task: Task) {
        let started = std::time::Instant::now();
        let result = match task {
            Task::VmFull => vm_sync::full_sync(&self.db).await,
            Task::VmQuick => vm_sync::quick_sync(&self.db).await,
            Task::TemplateFull => template_sync::full_sync(&self.db).await,
            Task::TemplateVerify => template_sync::verify(&self.db).await,
            Task::IsoFull => iso_sync::full_sync(&self.db).await,
            Task::IsoVerify => iso_sync::verify(&self.db).await,
        };
        let now = proxmox_time::epoch_i64();
        let mut stats = self.stats.lock().unwrap();

        match result {
            Ok(count) => {
                self.error_count = 0;
                stats.error_count = 0;
                match task {
                    Task::VmFull => {
                        stats.last_full_sync = Some(now);
                        stats.full_sync_count += 1;
                        stats.vms_synced = count;
                        stats.sync_duration_secs = started.elapsed().as_secs_f64();
                        log::info!(
                            "full sync completed: {count} VMs in {:.1}s",
                            stats.sync_duration_secs
                        );
                    }
                    Task::VmQuick => {
                        stats.last_quick_sync = Some(now);
                        stats.quick_sync_count += 1;
                    }
                    Task::TemplateFull => {
                        stats.last_template_full_sync = Some(now);
                        stats.template_full_sync_count += 1;
                        stats.templates_synced = count;
                    }
                    Task::TemplateVerify => stats.last_template_verify = Some(now),
                    Task::IsoFull => {
                        stats.last_iso_full_sync = Some(now);
                        stats.iso_full_sync_count += 1;
                        stats.isos_synced = count;
                    }
                    Task::IsoVerify => stats.last_iso_verify = Some(now),
                }
            }
            Err(err) => {
                let msg = format!("{err:#}");
                if is_expected_offline_error(&msg) {
                    // known-offline nodes are routine and do not back off
                    log::debug!("{task:?} skipped offline node: {msg}");
                } else {
                    self.error_count += 1;
                    stats.error_count = self.error_count;
                    stats.last_error = Some(msg.clone());
                    log::error!("{task:?} failed (attempt {}): {msg}", self.error_count);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Task {
    VmFull,
    VmQuick,
    TemplateFull,
    TemplateVerify,
    IsoFull,
    IsoVerify,
}

/// Clusters the sync engine should look at.
pub(crate) fn active_clusters() -> Result<Vec<plm_api_types::clusters::ClusterConfig>, Error> {
    Ok(plm_config::clusters::config()?
        .into_iter()
        .filter(|cluster| cluster.is_active)
        .collect())
}
