//! VM listing and guest operations.
//!
//! All reads come from the synchronized inventory; nothing here queries a
//! cluster on the read path. Mutations go through the cluster API, then
//! update the inventory status eagerly and trigger an immediate sync.

use std::collections::HashSet;

use anyhow::Error;

use proxmox_router::{list_subdirs_api_method, Permission, Router, RpcEnvironment, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

use plm_api_types::{
    SNAPSHOT_NAME_SCHEMA, UserEntry, UserRole, VmInventoryEntry, VmListEntry, VMID_SCHEMA,
};

use crate::auth;
use crate::connection;
use crate::db::{self, Database};
use crate::error::LabError;
use crate::ip::{self, SweepMode};

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_VMS)
    .match_all("vmid", &VM_ROUTER);

const VM_ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(VM_SUBDIRS))
    .subdirs(VM_SUBDIRS);

#[sortable]
const VM_SUBDIRS: SubdirMap = &sorted!([
    ("config", &Router::new().get(&API_METHOD_GET_VM)),
    ("console", &super::console::TICKET_ROUTER),
    ("reimage", &Router::new().post(&API_METHOD_REIMAGE_VM)),
    ("refresh-ip", &Router::new().post(&API_METHOD_REFRESH_IP)),
    ("shutdown", &Router::new().post(&API_METHOD_SHUTDOWN_VM)),
    ("snapshot", &SNAPSHOT_ROUTER),
    ("start", &Router::new().post(&API_METHOD_START_VM)),
    ("stop", &Router::new().post(&API_METHOD_STOP_VM)),
    (
        "vncwebsocket",
        &super::console::WEBSOCKET_ROUTER
    ),
]);

const SNAPSHOT_ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_SNAPSHOTS)
    .post(&API_METHOD_CREATE_SNAPSHOT)
    .match_all("snapname", &SNAPSHOT_ITEM_ROUTER);

const SNAPSHOT_ITEM_ROUTER: Router = Router::new()
    .post(&API_METHOD_ROLLBACK_SNAPSHOT)
    .delete(&API_METHOD_DELETE_SNAPSHOT);

/// The VMIDs a non-admin caller may see.
///
/// Teachers see VMs they hold directly plus all VMs of classes they teach
/// or co-own; students see only VMs assigned to them.
fn visible_vmids(db: &Database, user: &UserEntry) -> Result<Option<HashSet<u32>>, Error> {
    if user.role.is_admin() {
        return Ok(None);
    }

    let mut vmids: HashSet<u32> = db
        .list_assignments_for_user(user.id)?
        .into_iter()
        .map(|vm| vm.proxmox_vmid)
        .collect();

    if user.role.is_teacher() {
        for class_id in db.owned_class_ids(user.id)? {
            vmids.extend(
                db.list_assignments_for_class(class_id)?
                    .into_iter()
                    .map(|vm| vm.proxmox_vmid),
            );
        }
    }

    Ok(Some(vmids))
}

/// Console access shares the VM visibility rules.
pub(super) fn check_console_access(
    db: &Database,
    user: &UserEntry,
    vmid: u32,
) -> Result<VmInventoryEntry, Error> {
    check_vm_access(db, user, vmid)
}

/// Check that the caller may operate on a VM, returning its inventory row.
fn check_vm_access(
    db: &Database,
    user: &UserEntry,
    vmid: u32,
) -> Result<VmInventoryEntry, Error> {
    let entry = db
        .find_vm_any_cluster(vmid)?
        .ok_or_else(|| LabError::NotFound(format!("no such VM {vmid}")))?;

    if let Some(visible) = visible_vmids(db, user)? {
        if !visible.contains(&vmid) {
            return Err(LabError::AccessDenied(format!(
                "user '{}' has no access to VM {vmid}",
                user.username
            ))
            .into());
        }
    }

    Ok(entry)
}

#[api(
    input: {
        properties: {
            "cluster": {
                schema: plm_api_types::CLUSTER_ID_SCHEMA,
                optional: true,
            },
            "search": {
                description: "Filter by name, VMID, node or IP.",
                type: String,
                optional: true,
            },
        },
    },
    returns: {
        type: Array,
        description: "Inventory rows the caller may see.",
        items: { type: VmListEntry },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Rows are filtered by the caller's role.",
    },
)]
/// List VMs from the synchronized inventory.
pub fn list_vms(
    cluster: Option<String>,
    search: Option<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Vec<VmListEntry>, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;

    let vmid_filter = visible_vmids(db, &user).map_err(http_error)?;
    let entries = db
        .list_vms(cluster.as_deref(), search.as_deref(), vmid_filter.as_ref())
        .map_err(http_error)?;

    let assignments = db.list_assignments().map_err(http_error)?;
    let is_admin = user.role.is_admin();

    let mut list = Vec::with_capacity(entries.len());
    for entry in entries {
        let assignment = assignments
            .iter()
            .find(|vm| vm.proxmox_vmid == entry.vmid);

        let is_builder_vm = assignment.map(|vm| vm.is_builder_vm()).unwrap_or(false);

        // the owning username is admin-only information
        let mapped_to = if is_admin {
            match assignment.and_then(|vm| vm.assigned_user_id) {
                Some(user_id) => db.username_of(user_id).ok(),
                None => None,
            }
        } else {
            None
        };

        list.push(VmListEntry {
            entry,
            is_builder_vm,
            mapped_to,
        });
    }

    Ok(list)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    returns: { type: VmInventoryEntry },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// A single inventory row.
pub fn get_vm(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<VmInventoryEntry, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    check_vm_access(db, &user, vmid).map_err(http_error)
}

async fn power_operation(vmid: u32, rpcenv: &mut dyn RpcEnvironment, op: &str) -> Result<String, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let client = connection::make_pve_client_for(&entry.cluster_id)
        .await
        .map_err(http_error)?;

    let (upid, eager_status) = match op {
        "start" => (
            client.start_guest(&entry.node, entry.kind, vmid).await?,
            "running",
        ),
        "shutdown" => (
            client.shutdown_guest(&entry.node, entry.kind, vmid).await?,
            "stopped",
        ),
        "stop" => (
            client.stop_guest(&entry.node, entry.kind, vmid).await?,
            "stopped",
        ),
        _ => unreachable!("unknown power operation"),
    };

    // eager status update so the next read does not wait for the sync loop
    db.set_vm_status(&entry.cluster_id, vmid, eager_status)
        .map_err(http_error)?;
    crate::sync::trigger_immediate_sync();

    Ok(upid)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// Start a VM.
pub async fn start_vm(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<String, Error> {
    power_operation(vmid, rpcenv, "start").await
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// Cleanly shut a VM down.
pub async fn shutdown_vm(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<String, Error> {
    power_operation(vmid, rpcenv, "shutdown").await
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// Hard stop a VM.
pub async fn stop_vm(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<String, Error> {
    power_operation(vmid, rpcenv, "stop").await
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Reset a student VM to its clean state.
pub async fn reimage_vm(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;
    check_vm_access(db, &user, vmid).map_err(http_error)?;

    crate::deploy::reimage_vm(db, vmid).await.map_err(http_error)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// Refresh a VM's IP address.
///
/// Cached data is returned immediately; the ARP sweep runs detached.
pub async fn refresh_ip(vmid: u32, rpcenv: &mut dyn RpcEnvironment) -> Result<Option<String>, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let cluster = plm_config::clusters::get_cluster(&entry.cluster_id).map_err(http_error)?;

    let assignment = db.get_assignment_by_vmid(vmid).map_err(http_error)?;
    let target = ip::IpTarget {
        vmid,
        kind: entry.kind,
        node: entry.node.clone(),
        running: entry.status == "running",
        mac: assignment
            .as_ref()
            .and_then(|vm| vm.mac_address.clone())
            .or_else(|| entry.mac_address.clone()),
        // force a fresh lookup
        cached_ip: None,
        ip_updated_at: None,
        category: entry.category.clone(),
    };

    let resolved = ip::resolve_cluster_ips(db, &cluster, &[target], SweepMode::Background).await;
    Ok(resolved.get(&vmid).cloned().or(entry.ip))
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
        },
    },
    returns: {
        type: Array,
        description: "Snapshots of the VM.",
        items: {
            type: Object,
            description: "Snapshot entry.",
            properties: {},
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Restricted to VMs the caller may see.",
    },
)]
/// List the snapshots of a VM.
pub async fn list_snapshots(
    vmid: u32,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<serde_json::Value, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let client = connection::make_pve_client_for(&entry.cluster_id)
        .await
        .map_err(http_error)?;
    let snapshots = client.list_snapshots(&entry.node, entry.kind, vmid).await?;
    Ok(serde_json::to_value(snapshots)?)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
            snapname: { schema: SNAPSHOT_NAME_SCHEMA },
            description: {
                description: "Snapshot description.",
                type: String,
                optional: true,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Take a snapshot.
pub async fn create_snapshot(
    vmid: u32,
    snapname: String,
    description: Option<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<String, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let client = connection::make_pve_client_for(&entry.cluster_id)
        .await
        .map_err(http_error)?;
    Ok(client
        .create_snapshot(&entry.node, entry.kind, vmid, &snapname, description.as_deref())
        .await?)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
            snapname: { schema: SNAPSHOT_NAME_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Roll a VM back to a snapshot.
pub async fn rollback_snapshot(
    vmid: u32,
    snapname: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<String, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let client = connection::make_pve_client_for(&entry.cluster_id)
        .await
        .map_err(http_error)?;
    let upid = client
        .rollback_snapshot(&entry.node, entry.kind, vmid, &snapname)
        .await?;
    crate::sync::trigger_immediate_sync();
    Ok(upid)
}

#[api(
    input: {
        properties: {
            vmid: { schema: VMID_SCHEMA },
            snapname: { schema: SNAPSHOT_NAME_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Delete a snapshot.
pub async fn delete_snapshot(
    vmid: u32,
    snapname: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<String, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;
    let entry = check_vm_access(db, &user, vmid).map_err(http_error)?;

    let client = connection::make_pve_client_for(&entry.cluster_id)
        .await
        .map_err(http_error)?;
    Ok(client
        .delete_snapshot(&entry.node, entry.kind, vmid, &snapname)
        .await?)
}
