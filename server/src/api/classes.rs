//! Class management and enrollment.

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{list_subdirs_api_method, Permission, Router, RpcEnvironment, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

use plm_api_types::{
    ClassConfig, ClassConfigUpdater, ClassSummary, DeploymentResult, UserRole, JOIN_TOKEN_SCHEMA,
    NODE_SCHEMA,
};

use crate::auth;
use crate::classes;
use crate::db;
use crate::deploy;
use crate::error::LabError;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_CLASSES)
    .post(&API_METHOD_CREATE_CLASS)
    .match_all("class-id", &ITEM_ROUTER);

const ITEM_ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(ITEM_SUBDIRS))
    .put(&API_METHOD_UPDATE_CLASS)
    .delete(&API_METHOD_DELETE_CLASS)
    .subdirs(ITEM_SUBDIRS);

#[sortable]
const ITEM_SUBDIRS: SubdirMap = &sorted!([
    ("allocate", &Router::new().post(&API_METHOD_ALLOCATE_VM)),
    ("deploy", &Router::new().post(&API_METHOD_DEPLOY_VMS)),
    ("join-token", &Router::new().post(&API_METHOD_ISSUE_JOIN_TOKEN).delete(&API_METHOD_REVOKE_JOIN_TOKEN)),
    ("summary", &Router::new().get(&API_METHOD_CLASS_SUMMARY)),
]);

/// Joining is addressed by token, not by class, so it lives at the top
/// level next to the collection.
pub const JOIN_ROUTER: Router = Router::new().post(&API_METHOD_JOIN_CLASS);

fn load_class_checked(
    class_id: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(plm_api_types::UserEntry, ClassConfig), Error> {
    let user = auth::current_user(rpcenv)?;
    let class = db::get().get_class(class_id)?;
    if !auth::can_manage_class(&user, &class)? {
        return Err(LabError::AccessDenied(format!(
            "user '{}' does not manage class {class_id}",
            user.username
        ))
        .into());
    }
    Ok((user, class))
}

#[api(
    returns: {
        type: Array,
        description: "Classes visible to the caller.",
        items: { type: ClassConfig },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Admins see all classes, teachers the ones they own or co-own, students the ones they are enrolled in.",
    },
)]
/// List classes.
pub fn list_classes(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<ClassConfig>, Error> {
    let db = db::get();
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    let classes = db.list_classes().map_err(http_error)?;

    if user.role.is_admin() {
        return Ok(classes);
    }

    let owned = db.owned_class_ids(user.id).map_err(http_error)?;
    let mut visible = Vec::new();
    for class in classes {
        if owned.contains(&class.id) || db.is_enrolled(user.id, class.id).map_err(http_error)? {
            visible.push(class);
        }
    }
    Ok(visible)
}

#[api(
    input: {
        properties: {
            name: {
                description: "Class name, also the prefix for student VM names.",
                type: String,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the teacher role.",
    },
)]
/// Create a class.
pub fn create_class(name: String, rpcenv: &mut dyn RpcEnvironment) -> Result<i64, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Teacher).map_err(http_error)?;

    db::get().insert_class(&name, user.id).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
            updater: {
                flatten: true,
                type: ClassConfigUpdater,
            },
            "expected-version": {
                description: "The lock version the caller based its changes on.",
                type: Integer,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Update class settings.
///
/// Optimistic: the caller supplies the `lock_version` it loaded; concurrent
/// modification yields a conflict asking to reload and retry.
pub async fn update_class(
    class_id: i64,
    updater: ClassConfigUpdater,
    expected_version: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let (_user, mut class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;

    // settings commits are serialized per class
    let _guard = db::get()
        .class_locks()
        .lock(class_id)
        .await
        .map_err(http_error)?;

    class.lock_version = expected_version;

    if let Some(v) = updater.name {
        class.name = v;
    }
    if let Some(v) = updater.description {
        class.description = Some(v);
    }
    if let Some(v) = updater.template_id {
        class.template_id = Some(v);
    }
    if let Some(v) = updater.pool_size {
        class.pool_size = v;
    }
    if let Some(v) = updater.deployment_method {
        class.deployment_method = v;
    }
    if let Some(v) = updater.deployment_cluster {
        class.deployment_cluster = Some(v);
    }
    if let Some(v) = updater.vmid_prefix {
        class.vmid_prefix = Some(v);
    }
    if let Some(v) = updater.auto_shutdown {
        class.auto_shutdown = v;
    }
    if let Some(v) = updater.restrict_hours {
        class.restrict_hours = v;
    }
    if let Some(v) = updater.max_usage_hours {
        class.max_usage_hours = v;
    }
    if let Some(v) = updater.cpu_cores {
        class.cpu_cores = Some(v);
    }
    if let Some(v) = updater.memory_mb {
        class.memory_mb = Some(v);
    }

    db::get().update_class(&class).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Delete a class along with its assignments and class templates.
pub fn delete_class(class_id: i64, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let (_user, _class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;
    db::get().delete_class(class_id).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
        },
    },
    returns: { type: ClassSummary },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// A class with derived pool statistics.
pub fn class_summary(
    class_id: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<ClassSummary, Error> {
    let (_user, class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;
    classes::class_summary(db::get(), class).map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
            "expires-in-days": {
                description: "Token lifetime; 0 means it never expires.",
                type: Integer,
                minimum: 0,
                optional: true,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Issue a fresh join token.
pub fn issue_join_token(
    class_id: i64,
    expires_in_days: Option<u32>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<String, Error> {
    let (_user, _class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;
    classes::generate_join_token(
        db::get(),
        class_id,
        expires_in_days.unwrap_or(classes::DEFAULT_TOKEN_DAYS),
    )
    .map_err(http_error)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Invalidate the current join token.
pub fn revoke_join_token(class_id: i64, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let (_user, _class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;
    classes::invalidate_join_token(db::get(), class_id).map_err(http_error)
}

#[api(
    input: {
        properties: {
            token: { schema: JOIN_TOKEN_SCHEMA },
        },
    },
    returns: {
        type: Object,
        description: "Enrollment outcome.",
        properties: {
            "class-id": {
                description: "The joined class.",
                type: Integer,
            },
            "newly-enrolled": {
                description: "False when the user was already enrolled.",
                type: Boolean,
            },
            vmid: {
                description: "The VM held by the user, if one was available.",
                type: Integer,
                optional: true,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Any authenticated user may join with a valid token.",
    },
)]
/// Join a class via token; idempotent.
pub async fn join_class(token: String, rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;

    let outcome = classes::join_via_token(db::get(), user.id, &token)
        .await
        .map_err(http_error)?;

    Ok(json!({
        "class-id": outcome.class_id,
        "newly-enrolled": outcome.newly_enrolled,
        "vmid": outcome.assigned_vmid,
    }))
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
            "user-id": {
                description: "The enrolled user to allocate a VM to.",
                type: Integer,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Manually allocate a pool VM to an enrolled user.
pub async fn allocate_vm(
    class_id: i64,
    user_id: i64,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<u32, Error> {
    let (_user, _class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;

    let assignment = classes::allocate_pool_vm(db::get(), class_id, user_id)
        .await
        .map_err(http_error)?;
    Ok(assignment.proxmox_vmid)
}

#[api(
    input: {
        properties: {
            "class-id": {
                description: "Database ID of the class.",
                type: Integer,
            },
            count: {
                description: "Number of student VMs to create.",
                type: Integer,
                minimum: 1,
            },
            node: {
                schema: NODE_SCHEMA,
                optional: true,
            },
        },
    },
    returns: { type: DeploymentResult },
    access: {
        permission: &Permission::Anybody,
        description: "Requires class ownership.",
    },
)]
/// Deploy student VMs for a class from its template.
pub async fn deploy_vms(
    class_id: i64,
    count: u32,
    node: Option<String>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<DeploymentResult, Error> {
    let (_user, _class) = load_class_checked(class_id, rpcenv).map_err(http_error)?;

    deploy::deploy_student_vms(db::get(), class_id, count as usize, node.as_deref())
        .await
        .map_err(http_error)
}
