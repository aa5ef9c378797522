//! Snapshot based linked-clone deployment.
//!
//! `qm clone` runs on the template's node over SSH; cross-node placement
//! appends `--target`. Every created guest gets a `baseline` snapshot, the
//! reimage target.

use std::time::Duration;

use anyhow::{format_err, Error};

use plm_api_types::clusters::ClusterConfig;
use plm_api_types::{ClassConfig, CreatedVm, DeploymentResult, GuestKind};

use crate::connection;
use crate::db::Database;
use crate::deploy::{names, placement::NodeBalancer, vmid, BASELINE_SNAPSHOT};
use crate::shell::{self, quote_arg};

/// Clone operations get a generous deadline.
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Locate the node a template VM lives on.
pub async fn find_template_node(
    cluster: &ClusterConfig,
    template_vmid: u32,
) -> Result<String, Error> {
    let client = connection::make_pve_client(cluster).await?;

    if let Ok(resources) = client.cluster_resources(Some("vm")).await {
        if let Some(node) = resources
            .iter()
            .find(|r| r.vmid == Some(template_vmid))
            .and_then(|r| r.node.clone())
        {
            return Ok(node);
        }
    }

    // fallback: probe each node directly
    for node in client.list_nodes().await? {
        if let Ok(guests) = client.list_qemu(&node.node).await {
            if guests.iter().any(|g| g.vmid == template_vmid) {
                return Ok(node.node);
            }
        }
    }

    Err(format_err!(
        "template VM {template_vmid} not found on any node of cluster '{}'",
        cluster.id
    ))
}

/// Deploy `count` linked clones of `template_vmid` for a class.
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

    let template_node = find_template_node(cluster, template_vmid).await?;

    // student VMs inherit the template's disk storage
    let storage = client
        .guest_config(&template_node, GuestKind::Qemu, template_vmid)
        .await?
        .primary_disk_storage()
        .or_else(|| cluster.template_storage.clone())
        .or_else(|| cluster.default_storage.clone())
        .ok_or_else(|| {
            format_err!("cannot determine disk storage of template {template_vmid}")
        })?;

    // qm clone must run from the template's node; resolve its address
    // through the gateway since node names are often cluster-internal
    let gateway = shell::acquire(cluster, &cluster.host).await?;
    let template_node_addr = match shell::resolve_node_address(&gateway, &template_node).await? {
        Some(addr) => addr,
        None => {
            log::warn!(
                "could not resolve '{template_node}' via gateway, trying the hostname directly"
            );
            template_node.clone()
        }
    };
    let ssh = shell::acquire(cluster, &template_node_addr).await?;

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
        // with a VMID prefix the range is sequential by contract; without
        // one we skip over occupied ids
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

        let mut cmd = format!(
            "qm clone {template_vmid} {new_vmid} --name {} --storage {}",
            quote_arg(&vm_name),
            quote_arg(&storage)
        );
        if target_node != template_node {
            cmd.push_str(&format!(" --target {}", quote_arg(&target_node)));
        }

        match ssh.execute(&cmd, CLONE_TIMEOUT, true).await {
            Ok(_) => {}
            Err(err) => {
                let msg = format!("failed to create VM {new_vmid}: {err:#}");
                log::error!("{msg}");
                result.errors.push(msg);
                result.error_count += 1;
                continue;
            }
        }

        // verify via the API before recording anything
        let config = match client
            .guest_config(&target_node, GuestKind::Qemu, new_vmid)
            .await
        {
            Ok(config) => config,
            Err(err) => {
                let msg = format!("VM {new_vmid} created but not verified: {err}");
                log::error!("{msg}");
                result.errors.push(msg);
                result.error_count += 1;
                continue;
            }
        };

        let assignment_id =
            db.insert_assignment_row(Some(class.id), new_vmid, &vm_name, &target_node, false, false)?;
        if let Some(mac) = config.primary_mac() {
            // wire up the MAC for ARP discovery right away
            let conn = db.lock_conn();
            let _ = conn.execute(
                "UPDATE vm_assignments SET mac_address = ?1 WHERE id = ?2",
                rusqlite::params![mac, assignment_id],
            );
        }
        db.set_target_hostname(assignment_id, &vm_name)?;

        log::info!("created linked clone {new_vmid} ({vm_name}) on {target_node}");
        result.vms.push(CreatedVm {
            vmid: new_vmid,
            name: vm_name,
            node: target_node,
        });
        result.created_count += 1;
    }

    // baseline snapshots are the reimage target
    for vm in &result.vms {
        match client
            .create_snapshot(
                &vm.node,
                GuestKind::Qemu,
                vm.vmid,
                BASELINE_SNAPSHOT,
                Some("Clean state after deployment, used for reimage"),
            )
            .await
        {
            Ok(_) => {}
            Err(err) => {
                let msg = format!("baseline snapshot for VM {} failed: {err}", vm.vmid);
                log::error!("{msg}");
                result.errors.push(msg);
                result.error_count += 1;
            }
        }
    }

    Ok(result)
}
