//! Periodic background IP discovery.
//!
//! The full sync already resolves addresses synchronously; this task fills
//! the gaps between full syncs for guests that came up in the meantime.

use std::pin::pin;

use anyhow::Error;

use server::db::Database;
use server::ip::{self, SweepMode};
use server::sync::vm_sync;
use server::task_utils;

const SCAN_INTERVAL: u64 = 300;

pub fn start_task(db: Database) {
    tokio::spawn(async move {
        let task = pin!(ip_scan_task(db));
        let abort_future = pin!(proxmox_daemon::shutdown_future());
        futures::future::select(task, abort_future).await;
    });
}

async fn ip_scan_task(db: Database) -> Result<(), Error> {
    loop {
        let delay_target = task_utils::next_aligned_instant(SCAN_INTERVAL);
        tokio::time::sleep_until(tokio::time::Instant::from_std(delay_target)).await;

        if let Err(err) = scan_once(&db).await {
            log::error!("background IP scan failed: {err:#}");
        }
    }
}

async fn scan_once(db: &Database) -> Result<(), Error> {
    for cluster in plm_config::clusters::config()? {
        if !cluster.is_active || !cluster.enable_ip_lookup {
            continue;
        }

        let entries = db.list_vms(Some(&cluster.id), None, None)?;
        // only running guests without a known address are worth a scan
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.status == "running" && !entry.is_template)
            .filter(|entry| {
                entry
                    .ip
                    .as_deref()
                    .map(plm_api_types::is_ip_placeholder)
                    .unwrap_or(true)
            })
            .collect();

        if entries.is_empty() {
            continue;
        }

        let targets = vm_sync::build_ip_targets(db, &cluster, &entries);
        let resolved = ip::resolve_cluster_ips(db, &cluster, &targets, SweepMode::Sync).await;
        if !resolved.is_empty() {
            log::info!(
                "background IP scan resolved {} addresses on '{}'",
                resolved.len(),
                cluster.id
            );
        }
    }
    Ok(())
}
