//! Login and user management.

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{list_subdirs_api_method, Permission, Router, RpcEnvironment, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

use plm_api_types::{UserEntry, UserRole, PLM_PASSWORD_SCHEMA};

use crate::auth;
use crate::db;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    ("ticket", &Router::new().post(&API_METHOD_CREATE_TICKET)),
    ("users", &USERS_ROUTER),
]);

const USERS_ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_USERS)
    .post(&API_METHOD_CREATE_USER)
    .match_all("userid", &USER_ITEM_ROUTER);

const USER_ITEM_ROUTER: Router = Router::new().put(&API_METHOD_UPDATE_USER_ROLE);

#[api(
    input: {
        properties: {
            username: {
                description: "Login name.",
                type: String,
            },
            password: { schema: PLM_PASSWORD_SCHEMA },
        },
    },
    returns: {
        type: Object,
        description: "Ticket and CSRF token on success.",
        properties: {
            username: {
                description: "The authenticated user.",
                type: String,
            },
            ticket: {
                description: "Signed authentication ticket.",
                type: String,
            },
            CSRFPreventionToken: {
                description: "Token to include on write requests.",
                type: String,
            },
        },
    },
    access: {
        description: "Anyone can try to log in.",
        permission: &Permission::World,
    },
)]
/// Authenticate and create a ticket cookie.
///
/// Local database users authenticate against their stored hash; usernames
/// listed as cluster admins are accepted with their Proxmox credentials and
/// auto-provisioned as admin accounts.
pub async fn create_ticket(username: String, password: String) -> Result<Value, Error> {
    let db = db::get();

    let authenticated = match db.lookup_user_with_hash(&username)? {
        Some((_user, hash)) => auth::verify_password(&password, &hash)?,
        None => false,
    };

    let authenticated = if authenticated {
        true
    } else {
        // cluster admins may log in with their Proxmox credentials
        authenticate_against_cluster(&username, &password).await?
    };

    if !authenticated {
        // do not leak whether the user exists
        log::warn!("authentication failure for user '{username}'");
        return Err(http_error(
            crate::error::LabError::AccessDenied("authentication failed".to_string()).into(),
        ));
    }

    if db.lookup_user(&username)?.is_none() {
        // first login of a cluster admin: provision a local admin account
        let placeholder = auth::hash_password(&proxmox_uuid::Uuid::generate().to_string())?;
        db.create_user(&username, &placeholder, UserRole::Admin)?;
        log::info!("provisioned admin account for cluster user '{username}'");
    }

    let (ticket, csrf_token) = auth::create_ticket(&username)?;

    Ok(json!({
        "username": username,
        "ticket": ticket,
        "CSRFPreventionToken": csrf_token,
    }))
}

/// Check credentials against the clusters, restricted to configured admins.
async fn authenticate_against_cluster(username: &str, password: &str) -> Result<bool, Error> {
    if !auth::is_cluster_admin(username).await {
        return Ok(false);
    }

    for cluster in plm_config::clusters::config()? {
        // realm suffixed names are tried as-is, bare names with @pve
        let mut probe = cluster.clone();
        probe.user = if username.contains('@') {
            username.to_string()
        } else {
            format!("{username}@pve")
        };
        probe.password = password.to_string();

        match crate::connection::make_pve_client_uncached(&probe).await {
            Ok(client) => {
                if client.version().await.is_ok() {
                    return Ok(true);
                }
            }
            Err(err) => log::debug!("cluster auth on '{}' failed: {err}", cluster.id),
        }
    }

    Ok(false)
}

#[api(
    returns: {
        type: Array,
        description: "All user accounts.",
        items: { type: UserEntry },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// List user accounts.
pub fn list_users(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<UserEntry>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    db::get().list_users().map_err(http_error)
}

#[api(
    input: {
        properties: {
            username: {
                description: "Login name.",
                type: String,
            },
            password: { schema: PLM_PASSWORD_SCHEMA },
            role: { type: UserRole },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Create a user account.
pub fn create_user(
    username: String,
    password: String,
    role: UserRole,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<i64, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    let hash = auth::hash_password(&password)?;
    db::get()
        .create_user(&username, &hash, role)
        .map_err(http_error)
}

#[api(
    input: {
        properties: {
            userid: {
                description: "Database ID of the user.",
                type: Integer,
            },
            role: { type: UserRole },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Change a user's role.
pub fn update_user_role(
    userid: i64,
    role: UserRole,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    db::get().update_user_role(userid, role).map_err(http_error)
}
