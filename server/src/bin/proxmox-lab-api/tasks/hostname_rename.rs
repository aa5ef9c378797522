//! Hostname auto-renamer.
//!
//! Student VMs carry their DNS-safe name as `target_hostname`; once a guest
//! is up, the name is applied in-guest via `qm guest exec` on the guest's
//! node and the assignment is marked configured. Pending renames are
//! retried until the guest agent answers.

use std::pin::pin;
use std::time::Duration;

use anyhow::Error;

use server::db::Database;
use server::shell::{self, hop_command, quote_arg};
use server::task_utils;

const RENAME_INTERVAL: u64 = 120;

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

pub fn start_task(db: Database) {
    tokio::spawn(async move {
        let task = pin!(rename_task(db));
        let abort_future = pin!(proxmox_daemon::shutdown_future());
        futures::future::select(task, abort_future).await;
    });
}

async fn rename_task(db: Database) -> Result<(), Error> {
    loop {
        let delay_target = task_utils::next_aligned_instant(RENAME_INTERVAL);
        tokio::time::sleep_until(tokio::time::Instant::from_std(delay_target)).await;

        if let Err(err) = retry_pending_renames(&db).await {
            log::error!("hostname rename pass failed: {err:#}");
        }
    }
}

async fn retry_pending_renames(db: &Database) -> Result<(), Error> {
    let pending = db.list_pending_renames()?;
    if pending.is_empty() {
        return Ok(());
    }

    for vm in pending {
        let hostname = match &vm.target_hostname {
            Some(hostname) => hostname.clone(),
            None => continue,
        };

        let entry = match db.find_vm_any_cluster(vm.proxmox_vmid)? {
            Some(entry) if entry.status == "running" => entry,
            // stopped guests are retried on a later pass
            _ => continue,
        };

        let cluster = match plm_config::clusters::get_cluster(&entry.cluster_id) {
            Ok(cluster) => cluster,
            Err(err) => {
                log::debug!("no cluster for VM {}: {err}", vm.proxmox_vmid);
                continue;
            }
        };

        match apply_hostname(&cluster, &entry.node, vm.proxmox_vmid, &hostname).await {
            Ok(()) => {
                db.mark_hostname_configured(vm.id)?;
                log::info!("renamed VM {} to '{hostname}'", vm.proxmox_vmid);
            }
            Err(err) => {
                // the agent may simply not be up yet
                log::debug!(
                    "hostname rename of VM {} pending: {err}",
                    vm.proxmox_vmid
                );
            }
        }
    }

    Ok(())
}

async fn apply_hostname(
    cluster: &plm_api_types::clusters::ClusterConfig,
    node: &str,
    vmid: u32,
    hostname: &str,
) -> Result<(), Error> {
    let gateway = shell::acquire(cluster, &cluster.host).await?;

    let exec = format!(
        "qm guest exec {vmid} -- hostnamectl set-hostname {}",
        quote_arg(hostname)
    );

    // `qm guest exec` must run on the node hosting the guest
    let gateway_node = gateway
        .execute("hostname", shell::DEFAULT_COMMAND_TIMEOUT, false)
        .await?
        .stdout
        .trim()
        .to_string();

    let cmd = if gateway_node == node {
        exec
    } else {
        hop_command(node, &exec)
    };

    gateway.execute(&cmd, EXEC_TIMEOUT, true).await?;
    Ok(())
}
