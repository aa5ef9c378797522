//! Student VM deployment engine.
//!
//! Two strategies: snapshot based linked clones (`qm clone`) and overlay
//! VMs backed by an exported base image. Batch creation for one class is
//! serialized by the class lock; batches on different classes run in
//! parallel.

use std::time::Duration;

use anyhow::{format_err, Error};

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::{ClassConfig, DeploymentMethod, DeploymentResult, GuestKind};

use crate::connection;
use crate::db::Database;
use crate::error::LabError;

pub mod config_clone;
pub mod linked_clone;
pub mod names;
pub mod placement;
pub mod vm_shell;
pub mod vmid;

/// Name of the reimage snapshot created on every linked clone.
pub const BASELINE_SNAPSHOT: &str = "baseline";

/// How long a guest may take to power off before reimage gives up.
pub const VM_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// The cluster a class deploys to: its configured one, or the default.
pub fn deployment_cluster(class: &ClassConfig) -> Result<ClusterConfig, Error> {
    let clusters = plm_config::clusters::config()?;

    if let Some(id) = &class.deployment_cluster {
        return clusters
            .into_iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| LabError::NotFound(format!("no such cluster '{id}'")).into());
    }

    clusters
        .into_iter()
        .filter(|c| c.allow_vm_deployment)
        .max_by_key(|c| (c.is_default, -c.priority))
        .ok_or_else(|| format_err!("no cluster allows VM deployment"))
}

/// Deploy `count` student VMs for a class from its template.
///
/// Holds the class lock for the whole batch. Per-VM failures are collected
/// into the result; infrastructure failures abort.
pub async fn deploy_student_vms(
    db: &Database,
    class_id: i64,
    count: usize,
    fixed_node: Option<&str>,
) -> Result<DeploymentResult, Error> {
    let _guard = db.class_locks().lock(class_id).await?;

    let class = db.get_class(class_id)?;
    let cluster = deployment_cluster(&class)?;
    if !cluster.allow_vm_deployment {
        return Err(LabError::InvalidInput(format!(
            "cluster '{}' does not allow VM deployment",
            cluster.id
        ))
        .into());
    }

    let template_id = class
        .template_id
        .ok_or_else(|| LabError::InvalidInput(format!("class {class_id} has no template")))?;
    let template = db.get_template(template_id)?;

    log::info!(
        "deploying {count} student VMs for class '{}' from template {} ({:?})",
        class.name,
        template.proxmox_vmid,
        class.deployment_method,
    );

    // record the ongoing batch so the UI can show deployment progress
    let task_id = format!("deploy-{}-{}", class.id, proxmox_time::epoch_i64());
    db.set_clone_task(class.id, Some(&task_id))?;

    let result = match class.deployment_method {
        DeploymentMethod::LinkedClone => {
            linked_clone::deploy(db, &cluster, &class, template.proxmox_vmid, count, fixed_node)
                .await
        }
        DeploymentMethod::ConfigClone => {
            config_clone::deploy(db, &cluster, &class, template.proxmox_vmid, count, fixed_node)
                .await
        }
    };

    db.set_clone_task(class.id, None)?;
    let result = result?;

    crate::sync::trigger_immediate_sync();
    Ok(result)
}

/// Reset a student VM to its clean state.
///
/// Linked clones roll back to the `baseline` snapshot; overlay VMs get a
/// fresh overlay from the class base image.
pub async fn reimage_vm(db: &Database, vmid: u32) -> Result<(), Error> {
    let assignment = db
        .get_assignment_by_vmid(vmid)?
        .ok_or_else(|| LabError::NotFound(format!("VM {vmid} is not managed")))?;
    let class_id = assignment
        .class_id
        .ok_or_else(|| LabError::InvalidInput(format!("VM {vmid} belongs to no class")))?;

    let _guard = db.class_locks().lock(class_id).await?;
    let class = db.get_class(class_id)?;
    let cluster = deployment_cluster(&class)?;

    match class.deployment_method {
        DeploymentMethod::LinkedClone => {
            let client = connection::make_pve_client(&cluster).await?;
            client
                .rollback_snapshot(&assignment.node, GuestKind::Qemu, vmid, BASELINE_SNAPSHOT)
                .await?;
            log::info!("rolled VM {vmid} back to '{BASELINE_SNAPSHOT}'");
        }
        DeploymentMethod::ConfigClone => {
            config_clone::reimage(&cluster, &assignment.node, vmid, class_id).await?;
            log::info!("recreated overlay of VM {vmid}");
        }
    }

    crate::sync::trigger_immediate_sync();
    Ok(())
}

/// Power a guest off and wait until the cluster reports it stopped.
pub async fn stop_and_wait(
    cluster: &ClusterConfig,
    node: &str,
    kind: GuestKind,
    vmid: u32,
) -> Result<(), Error> {
    let client = connection::make_pve_client(cluster).await?;

    let status = client.guest_status(node, kind, vmid).await?;
    if status.status == "stopped" {
        return Ok(());
    }

    client.stop_guest(node, kind, vmid).await?;

    let deadline = tokio::time::Instant::now() + VM_STOP_TIMEOUT;
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = client.guest_status(node, kind, vmid).await?;
        if status.status == "stopped" {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format_err!(
                "VM {vmid} did not stop within {}s",
                VM_STOP_TIMEOUT.as_secs()
            ));
        }
    }
}
