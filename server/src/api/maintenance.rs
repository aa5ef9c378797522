//! Maintenance and recovery endpoints.

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{list_subdirs_api_method, Permission, Router, RpcEnvironment, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

use plm_api_types::{UserRole, VmAssignment, VmInventoryEntry};

use crate::auth;
use crate::classes::policy;
use crate::db;
use crate::shell;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    (
        "orphans",
        &Router::new()
            .get(&API_METHOD_LIST_ORPHANS)
            .delete(&API_METHOD_DELETE_ORPHANS)
    ),
    (
        "recover",
        &Router::new()
            .get(&API_METHOD_SCAN_RECOVERABLE)
            .post(&API_METHOD_RECOVER_VMS)
    ),
    ("shell-pool", &Router::new().get(&API_METHOD_SHELL_POOL_STATS)),
]);

#[api(
    returns: {
        type: Array,
        description: "Assignments belonging to no class and no user.",
        items: { type: VmAssignment },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// List orphaned assignments.
pub fn list_orphans(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<VmAssignment>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    policy::list_orphans(db::get()).map_err(http_error)
}

#[api(
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Delete orphaned assignments; pool VMs are never touched.
pub fn delete_orphans(rpcenv: &mut dyn RpcEnvironment) -> Result<usize, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    policy::delete_orphans(db::get()).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "The class whose VMID range is scanned.",
                type: Integer,
            },
        },
    },
    returns: {
        type: Array,
        description: "Untracked guests within the class VMID range.",
        items: { type: VmInventoryEntry },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Scan the inventory for guests recoverable into a class.
pub fn scan_recoverable(
    class_id: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Vec<VmInventoryEntry>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    policy::scan_recoverable_vms(db::get(), class_id).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "The class to attach the VMs to.",
                type: Integer,
            },
            vmids: {
                type: Array,
                description: "The confirmed subset of VMIDs to attach.",
                items: { schema: plm_api_types::VMID_SCHEMA },
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Attach the confirmed VMs to a class (update-in-place on known VMIDs).
pub fn recover_vms(
    class_id: i64,
    vmids: Vec<u32>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<usize, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    policy::add_vms_to_class(db::get(), class_id, &vmids).map_err(http_error)
}

#[api(
    returns: {
        type: Object,
        description: "SSH pool counters.",
        properties: {},
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// SSH connection pool statistics.
pub fn shell_pool_stats(rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    Ok(json!(shell::pool().stats()))
}
