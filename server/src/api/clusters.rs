//! Manage cluster configuration.

use anyhow::Error;

use proxmox_router::{http_bail, Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use plm_api_types::clusters::{ClusterConfig, ClusterConfigUpdater};
use plm_api_types::{UserRole, CLUSTER_ID_SCHEMA};

use crate::auth;
use crate::cache::registry;
use crate::connection;

use super::http_error;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_CLUSTERS)
    .post(&API_METHOD_ADD_CLUSTER)
    .match_all("id", &ITEM_ROUTER);

const ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_PROBE_CLUSTER)
    .put(&API_METHOD_UPDATE_CLUSTER)
    .delete(&API_METHOD_REMOVE_CLUSTER);

/// Strip the password before a config entry leaves the API.
fn redact(mut cluster: ClusterConfig) -> ClusterConfig {
    cluster.password = String::new();
    cluster
}

#[api(
    returns: {
        type: Array,
        description: "The list of configured clusters, passwords redacted.",
        items: { type: ClusterConfig },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// List all configured clusters.
pub fn list_clusters(rpcenv: &mut dyn RpcEnvironment) -> Result<Vec<ClusterConfig>, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    Ok(plm_config::clusters::config()?
        .into_iter()
        .map(redact)
        .collect())
}

#[api(
    input: {
        properties: {
            entry: {
                flatten: true,
                type: ClusterConfig,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Add a cluster.
pub fn add_cluster(entry: ClusterConfig, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    if plm_config::clusters::get_cluster(&entry.id).is_ok() {
        http_bail!(BAD_REQUEST, "cluster '{}' already exists", entry.id);
    }

    plm_config::clusters::save_cluster(&entry)?;
    crate::sync::trigger_immediate_sync();
    Ok(())
}

#[api(
    input: {
        properties: {
            id: { schema: CLUSTER_ID_SCHEMA },
            updater: {
                flatten: true,
                type: ClusterConfigUpdater,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Update a cluster entry.
///
/// The cached API client is invalidated so no connection keeps using stale
/// credentials.
pub fn update_cluster(
    id: String,
    updater: ClusterConfigUpdater,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<(), Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    let mut entry = plm_config::clusters::get_cluster(&id).map_err(http_error)?;

    if let Some(v) = updater.name {
        entry.name = v;
    }
    if let Some(v) = updater.host {
        entry.host = v;
    }
    if let Some(v) = updater.port {
        entry.port = v;
    }
    if let Some(v) = updater.user {
        entry.user = v;
    }
    if let Some(v) = updater.password {
        entry.password = v;
    }
    if let Some(v) = updater.verify_tls {
        entry.verify_tls = v;
    }
    if let Some(v) = updater.is_default {
        entry.is_default = v;
    }
    if let Some(v) = updater.is_active {
        entry.is_active = v;
    }
    if let Some(v) = updater.allow_vm_deployment {
        entry.allow_vm_deployment = v;
    }
    if let Some(v) = updater.allow_template_sync {
        entry.allow_template_sync = v;
    }
    if let Some(v) = updater.allow_iso_sync {
        entry.allow_iso_sync = v;
    }
    if let Some(v) = updater.auto_shutdown_enabled {
        entry.auto_shutdown_enabled = v;
    }
    if let Some(v) = updater.priority {
        entry.priority = v;
    }
    if let Some(v) = updater.default_storage {
        entry.default_storage = Some(v);
    }
    if let Some(v) = updater.template_storage {
        entry.template_storage = Some(v);
    }
    if let Some(v) = updater.iso_storage {
        entry.iso_storage = Some(v);
    }
    if let Some(v) = updater.qcow2_template_path {
        entry.qcow2_template_path = Some(v);
    }
    if let Some(v) = updater.qcow2_images_path {
        entry.qcow2_images_path = Some(v);
    }
    if let Some(v) = updater.admin_group {
        entry.admin_group = Some(v);
    }
    if let Some(v) = updater.admin_users {
        entry.admin_users = Some(v);
    }
    if let Some(v) = updater.arp_subnets {
        entry.arp_subnets = v;
    }
    if let Some(v) = updater.vm_cache_ttl {
        entry.vm_cache_ttl = Some(v);
    }
    if let Some(v) = updater.enable_ip_lookup {
        entry.enable_ip_lookup = v;
    }
    if let Some(v) = updater.enable_ip_persistence {
        entry.enable_ip_persistence = v;
    }
    if let Some(v) = updater.description {
        entry.description = Some(v);
    }

    let result = plm_config::clusters::save_cluster(&entry);

    // even a failed commit invalidates the client so the in-memory state
    // cannot diverge from the store
    connection::invalidate_client(&id);
    registry().invalidate_cluster(&id);

    result?;
    Ok(())
}

#[api(
    input: {
        properties: {
            id: { schema: CLUSTER_ID_SCHEMA },
        },
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Remove a cluster entry.
pub fn remove_cluster(id: String, rpcenv: &mut dyn RpcEnvironment) -> Result<(), Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    plm_config::clusters::remove_cluster(&id)?;
    connection::invalidate_client(&id);
    registry().invalidate_cluster(&id);
    Ok(())
}

#[api(
    input: {
        properties: {
            id: { schema: CLUSTER_ID_SCHEMA },
        },
    },
    returns: {
        type: Object,
        description: "The cluster's version info.",
        properties: {},
    },
    access: {
        permission: &Permission::Anybody,
        description: "Requires the admin role.",
    },
)]
/// Probe connectivity by querying the cluster's version.
pub async fn probe_cluster(
    id: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<serde_json::Value, Error> {
    let user = auth::current_user(rpcenv).map_err(http_error)?;
    auth::require_role(&user, UserRole::Admin).map_err(http_error)?;

    let client = connection::make_pve_client_for(&id)
        .await
        .map_err(http_error)?;
    let version = client.version().await?;
    Ok(serde_json::to_value(version)?)
}
