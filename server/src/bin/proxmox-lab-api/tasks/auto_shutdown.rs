//! Auto-shutdown checker.
//!
//! Enforces three per-class policies on assigned student VMs: idle
//! shutdown (sustained low CPU), allowed-hours windows and per-student
//! session budgets. Usage hours accumulate while an assigned VM runs.

use std::collections::HashMap;
use std::pin::pin;

use anyhow::Error;

use plm_api_types::{AssignmentStatus, ClassConfig, VmAssignment};

use server::connection;
use server::db::Database;
use server::task_utils;

const CHECK_INTERVAL: u64 = 60;

const DEFAULT_CPU_THRESHOLD: u8 = 20;
const DEFAULT_IDLE_MINUTES: u32 = 30;

/// Consecutive low-CPU observations per VM.
#[derive(Default)]
struct IdleTracker {
    low_cpu_checks: HashMap<u32, u32>,
}

pub fn start_task(db: Database) {
    tokio::spawn(async move {
        let task = pin!(auto_shutdown_task(db));
        let abort_future = pin!(proxmox_daemon::shutdown_future());
        futures::future::select(task, abort_future).await;
    });
}

async fn auto_shutdown_task(db: Database) -> Result<(), Error> {
    let mut tracker = IdleTracker::default();

    loop {
        let delay_target = task_utils::next_aligned_instant(CHECK_INTERVAL);
        tokio::time::sleep_until(tokio::time::Instant::from_std(delay_target)).await;

        if let Err(err) = check_all_classes(&db, &mut tracker).await {
            log::error!("auto-shutdown check failed: {err:#}");
        }
    }
}

/// Whether `hour` falls into the allowed window; windows may wrap over
/// midnight.
fn within_allowed_hours(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

async fn check_all_classes(db: &Database, tracker: &mut IdleTracker) -> Result<(), Error> {
    for class in db.list_classes()? {
        let policy_active = class.auto_shutdown.enabled
            || class.restrict_hours.enabled
            || class.max_usage_hours > 0;
        if !policy_active {
            continue;
        }

        for vm in db.list_assignments_for_class(class.id)? {
            if vm.status != AssignmentStatus::Assigned {
                continue;
            }
            if let Err(err) = check_vm(db, &class, &vm, tracker).await {
                log::debug!("auto-shutdown check for VM {} failed: {err}", vm.proxmox_vmid);
            }
        }
    }
    Ok(())
}

async fn check_vm(
    db: &Database,
    class: &ClassConfig,
    vm: &VmAssignment,
    tracker: &mut IdleTracker,
) -> Result<(), Error> {
    let entry = match db.find_vm_any_cluster(vm.proxmox_vmid)? {
        Some(entry) => entry,
        None => return Ok(()),
    };

    let cluster = plm_config::clusters::get_cluster(&entry.cluster_id)?;
    if !cluster.auto_shutdown_enabled {
        return Ok(());
    }

    let client = connection::make_pve_client(&cluster).await?;
    let status = client
        .guest_status(&entry.node, entry.kind, vm.proxmox_vmid)
        .await?;

    if status.status != "running" {
        tracker.low_cpu_checks.remove(&vm.proxmox_vmid);
        return Ok(());
    }

    // one check interval of runtime per iteration
    db.add_usage_hours(vm.id, CHECK_INTERVAL as f64 / 3600.0)?;

    // hour restriction wins over everything else
    if class.restrict_hours.enabled {
        let (start, end) = (
            class.restrict_hours.start.unwrap_or(0),
            class.restrict_hours.end.unwrap_or(0),
        );
        let hour = current_hour();
        if !within_allowed_hours(hour, start, end) {
            log::info!(
                "shutting down VM {} of class '{}': outside allowed hours ({start}-{end})",
                vm.proxmox_vmid,
                class.name
            );
            client
                .shutdown_guest(&entry.node, entry.kind, vm.proxmox_vmid)
                .await?;
            db.set_vm_status(&entry.cluster_id, vm.proxmox_vmid, "stopped")?;
            return Ok(());
        }
    }

    // session budget
    if class.max_usage_hours > 0 && vm.usage_hours >= class.max_usage_hours as f64 {
        log::info!(
            "shutting down VM {} of class '{}': session budget of {}h exhausted",
            vm.proxmox_vmid,
            class.name,
            class.max_usage_hours
        );
        client
            .shutdown_guest(&entry.node, entry.kind, vm.proxmox_vmid)
            .await?;
        db.set_vm_status(&entry.cluster_id, vm.proxmox_vmid, "stopped")?;
        return Ok(());
    }

    // idle detection
    if class.auto_shutdown.enabled {
        let threshold = class
            .auto_shutdown
            .cpu_threshold
            .unwrap_or(DEFAULT_CPU_THRESHOLD) as f64
            / 100.0;
        let idle_minutes = class
            .auto_shutdown
            .idle_minutes
            .unwrap_or(DEFAULT_IDLE_MINUTES);

        let cpu = status.cpu.unwrap_or(0.0);
        let checks = tracker.low_cpu_checks.entry(vm.proxmox_vmid).or_insert(0);

        if cpu < threshold {
            *checks += 1;
        } else {
            *checks = 0;
        }

        if *checks >= idle_minutes {
            log::info!(
                "shutting down VM {} of class '{}': idle for {idle_minutes} minutes",
                vm.proxmox_vmid,
                class.name
            );
            client
                .shutdown_guest(&entry.node, entry.kind, vm.proxmox_vmid)
                .await?;
            db.set_vm_status(&entry.cluster_id, vm.proxmox_vmid, "stopped")?;
            tracker.low_cpu_checks.remove(&vm.proxmox_vmid);
        }
    }

    Ok(())
}

fn current_hour() -> u8 {
    // epoch seconds to UTC hour of day
    ((proxmox_time::epoch_i64() % 86400) / 3600) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_allowed_hours() {
        // plain window 8-18
        assert!(within_allowed_hours(8, 8, 18));
        assert!(within_allowed_hours(17, 8, 18));
        assert!(!within_allowed_hours(18, 8, 18));
        assert!(!within_allowed_hours(3, 8, 18));

        // wrapping window 22-6
        assert!(within_allowed_hours(23, 22, 6));
        assert!(within_allowed_hours(2, 22, 6));
        assert!(!within_allowed_hours(12, 22, 6));

        // degenerate window means no restriction
        assert!(within_allowed_hours(12, 0, 0));
    }
}
