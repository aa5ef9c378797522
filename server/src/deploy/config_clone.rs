//! Overlay (config clone) deployment.
//!
//! Once per class the template's primary disk is exported to a standalone
//! QCOW2 base image on shared storage. Each student VM is an empty shell
//! carrying the template's non-disk config plus a fresh overlay backed by
//! that base image.

use std::time::Duration;

use anyhow::{format_err, Error};

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::{ClassConfig, CreatedVm, DeploymentResult, GuestKind};

use crate::connection;
use crate::db::Database;
use crate::deploy::{names, placement::NodeBalancer, vm_shell::VmShellConfig, vmid};
use crate::shell::{self, quote_arg, PooledSession};

/// Disk conversions can take a while on spinning storage.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(600);

/// Path of the exported base image for a class.
pub fn base_image_path(cluster: &ClusterConfig, class_id: i64) -> Result<String, Error> {
    let dir = cluster
        .qcow2_template_path
        .as_deref()
        .ok_or_else(|| format_err!("cluster '{}' has no qcow2-template-path", cluster.id))?;
    Ok(format!("{}/class-{}-base.qcow2", dir.trim_end_matches('/'), class_id))
}

/// Path of a student VM's overlay image.
pub fn overlay_path(cluster: &ClusterConfig, vmid: u32) -> Result<String, Error> {
    let dir = cluster
        .qcow2_images_path
        .as_deref()
        .ok_or_else(|| format_err!("cluster '{}' has no qcow2-images-path", cluster.id))?;
    Ok(format!(
        "{}/{}/vm-{}-disk-0.qcow2",
        dir.trim_end_matches('/'),
        vmid,
        vmid
    ))
}

/// The volume a student overlay is attached as (`storage:vmid/file`).
fn overlay_volume(storage: &str, vmid: u32) -> String {
    format!("{storage}:{vmid}/vm-{vmid}-disk-0.qcow2")
}

/// Export the template's primary disk to the class base image, unless it
/// already exists.
pub async fn export_base_image(
    cluster: &ClusterConfig,
    ssh: &PooledSession,
    template_node: &str,
    template_vmid: u32,
    class_id: i64,
) -> Result<String, Error> {
    let base = base_image_path(cluster, class_id)?;

    let exists = ssh
        .execute(
            &format!("test -f {}", quote_arg(&base)),
            shell::DEFAULT_COMMAND_TIMEOUT,
            false,
        )
        .await?;
    if exists.exit_code == 0 {
        log::info!("base image {base} already exists, reusing");
        return Ok(base);
    }

    let client = connection::make_pve_client(cluster).await?;
    let config = client
        .guest_config(template_node, GuestKind::Qemu, template_vmid)
        .await?;
    let (_slot, disk_value) = config
        .primary_disk()
        .ok_or_else(|| format_err!("template {template_vmid} has no disk"))?;
    let volid = disk_value.split(',').next().unwrap_or(disk_value);

    // pvesm resolves the volume to a filesystem path regardless of the
    // underlying storage type
    let source = ssh
        .run_checked(&format!("pvesm path {}", quote_arg(volid)))
        .await?
        .stdout
        .trim()
        .to_string();
    if source.is_empty() {
        return Err(format_err!("could not resolve path of volume '{volid}'"));
    }

    ssh.run_checked(&format!(
        "mkdir -p {}",
        quote_arg(base.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/"))
    ))
    .await?;

    log::info!("exporting template {template_vmid} disk to {base}");
    ssh.execute(
        &format!(
            "qemu-img convert -O qcow2 {} {}",
            quote_arg(&source),
            quote_arg(&base)
        ),
        CONVERT_TIMEOUT,
        true,
    )
    .await?;

    Ok(base)
}

/// Create one overlay backed by the class base image.
async fn create_overlay(
    cluster: &ClusterConfig,
    ssh: &PooledSession,
    base: &str,
    new_vmid: u32,
) -> Result<String, Error> {
    let overlay = overlay_path(cluster, new_vmid)?;

    ssh.run_checked(&format!(
        "mkdir -p {}",
        quote_arg(overlay.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("/"))
    ))
    .await?;

    ssh.run_checked(&format!(
        "qemu-img create -f qcow2 -F qcow2 -b {} {}",
        quote_arg(base),
        quote_arg(&overlay)
    ))
    .await?;

    Ok(overlay)
}

/// Deploy `count` overlay VMs for a class.
///
/// The caller holds the class lock.
pub async fn deploy(
    db: &Database,
    cluster: &ClusterConfig,
    class: &ClassConfig,
    template_vmid: u32,
    count: usize,
    fixed_node: Option<&str>,
) -> Result<DeploymentResult, Error> {
    let client = connection::make_pve_client(cluster).await?;

    let template_node = super::linked_clone::find_template_node(cluster, template_vmid).await?;
    let template_config = client
        .guest_config(&template_node, GuestKind::Qemu, template_vmid)
        .await?;

    let storage = template_config
        .primary_disk_storage()
        .or_else(|| cluster.default_storage.clone())
        .ok_or_else(|| format_err!("cannot determine storage of template {template_vmid}"))?;

    let gateway = shell::acquire(cluster, &cluster.host).await?;
    let base = export_base_image(cluster, &gateway, &template_node, template_vmid, class.id).await?;

    let mut used = vmid::used_vmids(cluster).await?;
    let mut cursor = match class.vmid_prefix {
        Some(prefix) => prefix * 100,
        None => vmid::next_free(&used, 100),
    };

    let mut balancer = match fixed_node {
        Some(_) => None,
        None => Some(NodeBalancer::new(cluster).await?),
    };

    let mut result = DeploymentResult::default();

    for i in 0..count {
        let new_vmid = match class.vmid_prefix {
            Some(_) => cursor,
            None => vmid::next_free(&used, cursor),
        };
        cursor = new_vmid + 1;
        used.insert(new_vmid);

        let target_node = match (fixed_node, balancer.as_mut()) {
            (Some(node), _) => node.to_string(),
            (None, Some(balancer)) => balancer.next_node(),
            (None, None) => template_node.clone(),
        };

        let vm_name = names::student_vm_name(&class.name, i, new_vmid);

        let outcome: Result<Option<String>, Error> = async {
            let mut shell_config = VmShellConfig::from_template_config(&template_config, &storage);
            shell_config.name = Some(vm_name.clone());
            // class level sizing overrides win over template values
            if let Some(cores) = class.cpu_cores {
                shell_config.cores = Some(cores as u64);
            }
            if let Some(memory) = class.memory_mb {
                shell_config.memory = Some(memory);
            }
            let mac = shell_config.primary_mac();

            client
                .create_qemu(&target_node, shell_config.to_api_options(new_vmid))
                .await?;

            create_overlay(cluster, &gateway, &base, new_vmid).await?;

            // attach the overlay; qm set must run on the guest's node
            let attach = format!(
                "qm set {new_vmid} --scsi0 {} --boot c --bootdisk scsi0",
                quote_arg(&overlay_volume(&storage, new_vmid))
            );
            let cmd = if target_node == template_node {
                attach
            } else {
                shell::hop_command(&target_node, &attach)
            };
            ssh_attach(&gateway, &cmd).await?;

            Ok(mac)
        }
        .await;

        match outcome {
            Ok(mac) => {
                let assignment_id = db.insert_assignment_row(
                    Some(class.id),
                    new_vmid,
                    &vm_name,
                    &target_node,
                    false,
                    false,
                )?;
                if let Some(mac) = mac {
                    let conn = db.lock_conn();
                    let _ = conn.execute(
                        "UPDATE vm_assignments SET mac_address = ?1 WHERE id = ?2",
                        rusqlite::params![mac, assignment_id],
                    );
                }
                db.set_target_hostname(assignment_id, &vm_name)?;

                log::info!("created overlay VM {new_vmid} ({vm_name}) on {target_node}");
                result.vms.push(CreatedVm {
                    vmid: new_vmid,
                    name: vm_name,
                    node: target_node,
                });
                result.created_count += 1;
            }
            Err(err) => {
                let msg = format!("failed to create VM {new_vmid}: {err:#}");
                log::error!("{msg}");
                result.errors.push(msg);
                result.error_count += 1;
            }
        }
    }

    Ok(result)
}

async fn ssh_attach(session: &PooledSession, cmd: &str) -> Result<(), Error> {
    session.run_checked(cmd).await?;
    Ok(())
}

/// Reimage an overlay VM: stop, drop the overlay, recreate it from the
/// class base image and start again.
pub async fn reimage(
    cluster: &ClusterConfig,
    node: &str,
    vm_vmid: u32,
    class_id: i64,
) -> Result<(), Error> {
    let client = connection::make_pve_client(cluster).await?;

    super::stop_and_wait(cluster, node, GuestKind::Qemu, vm_vmid).await?;

    let gateway = shell::acquire(cluster, &cluster.host).await?;
    let base = base_image_path(cluster, class_id)?;
    let overlay = overlay_path(cluster, vm_vmid)?;

    gateway
        .run_checked(&format!("rm -f {}", quote_arg(&overlay)))
        .await?;
    gateway
        .run_checked(&format!(
            "qemu-img create -f qcow2 -F qcow2 -b {} {}",
            quote_arg(&base),
            quote_arg(&overlay)
        ))
        .await?;

    client.start_guest(node, GuestKind::Qemu, vm_vmid).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_cluster_config;

    #[test]
    fn test_image_paths() {
        let mut cluster = fake_cluster_config("lab");
        cluster.qcow2_template_path = Some("/mnt/pve/tank/templates/".to_string());
        cluster.qcow2_images_path = Some("/mnt/pve/tank/images".to_string());

        assert_eq!(
            base_image_path(&cluster, 7).unwrap(),
            "/mnt/pve/tank/templates/class-7-base.qcow2"
        );
        assert_eq!(
            overlay_path(&cluster, 12301).unwrap(),
            "/mnt/pve/tank/images/12301/vm-12301-disk-0.qcow2"
        );
        assert_eq!(overlay_volume("tank", 12301), "tank:12301/vm-12301-disk-0.qcow2");

        cluster.qcow2_template_path = None;
        assert!(base_image_path(&cluster, 7).is_err());
    }
}
